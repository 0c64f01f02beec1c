//! Restore module - extract the newest backup matching a pattern
//!
//! Lists `backup_dir`, picks the latest archive whose name matches
//! `pattern` with [`select_latest`], and extracts it into `dest` through
//! the same staged extraction `unarchive` uses. With `sort_by: name` the
//! archive names must embed fixed-width timestamps (as produced by
//! `archive` with `dest_dir` and `prefix`); `mtime` and `ctime` order by
//! file times instead.

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use super::find::{find_files, FindQuery, SortBy};
use super::unarchive::extract;
use super::{Module, ModuleContext, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::backup::{select_latest, ArchiveEntry};

/// Module for restoring the latest backup
pub struct RestoreModule;

#[async_trait]
impl Module for RestoreModule {
    fn name(&self) -> &'static str {
        "restore"
    }

    fn description(&self) -> &'static str {
        "Extract the most recent archive matching a pattern"
    }

    fn required_params(&self) -> &[&'static str] {
        &["backup_dir", "pattern", "dest"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        SortBy::from_param(params.get_string("sort_by")?)?;
        Ok(())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let backup_dir = params.get_string_required("backup_dir")?;
        let pattern = params.get_string_required("pattern")?;
        let dest = params.get_string_required("dest")?;
        let creates = params.get_string("creates")?;
        let sort_by = SortBy::from_param(params.get_string("sort_by")?)?;

        if let Some(guard) = &creates {
            if context.path_exists(guard).await? {
                return Ok(ModuleOutput::ok(format!("Skipped restore, '{}' exists", guard))
                    .with_data("dest", json!(dest)));
            }
        }

        let found = find_files(context, &FindQuery::files(&backup_dir, &pattern, sort_by)).await?;
        let entries: Vec<ArchiveEntry> = found.iter().map(|f| f.to_archive_entry(sort_by)).collect();
        let latest = select_latest(&entries, &pattern)?;
        info!(host = %context.host, archive = %latest.path, "restoring");

        let changed = extract(context, &latest.path, &dest, creates.as_deref()).await?;
        let output = if changed {
            ModuleOutput::changed(format!("Restored '{}' into '{}'", latest.name, dest))
        } else {
            ModuleOutput::ok(format!("'{}' already restored", latest.name))
        };
        Ok(output
            .with_data("archive", json!(latest.path))
            .with_data("dest", json!(dest)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::ModuleError;
    use super::*;
    use crate::backup::BackupError;

    const LISTING: &str = "\
/b/app-20240101T000000.tar.gz\tapp-20240101T000000.tar.gz\t1\t1\t10
/b/app-20240115T000000.tar.gz\tapp-20240115T000000.tar.gz\t1\t1\t10
/b/other-20250101T000000.tar.gz\tother-20250101T000000.tar.gz\t1\t1\t10
";

    fn restore_params() -> ModuleParams {
        params(json!({
            "backup_dir": "/b",
            "pattern": "app-*.tar.gz",
            "dest": "/srv/app",
            "creates": "/srv/app/.restored",
        }))
    }

    #[tokio::test]
    async fn test_restores_latest_match() {
        let conn = ScriptedConnection::new();
        conn.fail("test -e '/srv/app/.restored'", 1);
        conn.ok("find ", LISTING);

        let out = RestoreModule.execute(&restore_params(), &context(&conn)).await.unwrap();
        assert!(out.changed);
        assert_eq!(out.data["archive"], json!("/b/app-20240115T000000.tar.gz"));
        assert!(conn.ran("tar -xf '/b/app-20240115T000000.tar.gz'"));
    }

    #[tokio::test]
    async fn test_guard_short_circuits() {
        let conn = ScriptedConnection::new();
        let out = RestoreModule.execute(&restore_params(), &context(&conn)).await.unwrap();
        assert!(!out.changed);
        assert!(!conn.ran("find "));
    }

    #[tokio::test]
    async fn test_no_backups_is_not_found() {
        let conn = ScriptedConnection::new();
        conn.fail("test -e", 1);
        conn.ok("find ", "");
        let err = RestoreModule.execute(&restore_params(), &context(&conn)).await.unwrap_err();
        assert!(matches!(err, ModuleError::Backup(BackupError::NotFound(_))));
    }
}
