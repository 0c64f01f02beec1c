//! Copy module - place content at a destination path
//!
//! Content comes from `content`, from a control-node file (`src`, relative
//! to the playbook directory) or from a file already on the host
//! (`src` with `remote_src: true`). Destination content is compared byte
//! for byte; a write stages a sibling file and moves it into place.

use async_trait::async_trait;
use serde_json::json;
use std::path::Path;

use super::file::{apply_attributes, Attributes};
use super::{
    FileKind, Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult,
    ParamExt,
};
use crate::connection::shell_quote;

/// Module for copying content to hosts
pub struct CopyModule;

impl CopyModule {
    async fn read_local_source(context: &ModuleContext, src: &str) -> ModuleResult<Vec<u8>> {
        let path = Path::new(src);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            context.base_dir.join(path)
        };
        tokio::fs::read(&path).await.map_err(|e| {
            ModuleError::PreconditionFailed(format!("cannot read source '{}': {}", path.display(), e))
        })
    }

    /// Copy a file that already lives on the host; returns whether the
    /// destination changed.
    async fn copy_remote(context: &ModuleContext, src: &str, dest: &str) -> ModuleResult<bool> {
        if !context.path_exists(src).await? {
            return Err(ModuleError::PreconditionFailed(format!(
                "remote source '{}' does not exist",
                src
            )));
        }
        let (src_q, dest_q) = (shell_quote(src), shell_quote(dest));
        if context
            .probe(&format!("cmp -s {} {}", src_q, dest_q))
            .await?
        {
            return Ok(false);
        }

        let staging = shell_quote(&format!(
            "{}.converge-tmp-{}",
            dest,
            uuid::Uuid::new_v4().simple()
        ));
        let copied = context
            .run_checked(&format!("cp -p {} {} && mv -f {} {}", src_q, staging, staging, dest_q))
            .await;
        if copied.is_err() {
            let _ = context.run(&format!("rm -f {}", staging)).await;
        }
        copied.map(|_| true)
    }
}

#[async_trait]
impl Module for CopyModule {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn description(&self) -> &'static str {
        "Copy content or a file to a destination on the host"
    }

    fn required_params(&self) -> &[&'static str] {
        &["dest"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        match (params.get("content"), params.get("src")) {
            (Some(_), Some(_)) => Err(ModuleError::InvalidParameter(
                "'content' and 'src' are mutually exclusive".to_string(),
            )),
            (None, None) => Err(ModuleError::MissingParameter("content or src".to_string())),
            _ => {
                Attributes::from_params(params)?;
                Ok(())
            }
        }
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let mut dest = params.get_string_required("dest")?;
        let src = params.get_string("src")?;
        let attrs = Attributes::from_params(params)?;

        if let Some(stat) = context.stat(&dest).await? {
            if stat.kind == FileKind::Directory {
                let name = src
                    .as_deref()
                    .and_then(|s| Path::new(s).file_name())
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| {
                        ModuleError::PreconditionFailed(format!(
                            "destination '{}' is a directory",
                            dest
                        ))
                    })?;
                dest = format!("{}/{}", dest.trim_end_matches('/'), name);
            }
        }

        let mut changed = match (&src, params.get_bool_or("remote_src", false)?) {
            (Some(src), true) => Self::copy_remote(context, src, &dest).await?,
            _ => {
                let desired = match &src {
                    Some(src) => Self::read_local_source(context, src).await?,
                    None => match params.get("content") {
                        Some(serde_json::Value::String(s)) => s.clone().into_bytes(),
                        Some(other) => other.to_string().into_bytes(),
                        None => Vec::new(),
                    },
                };

                let current = match context.stat(&dest).await? {
                    Some(stat) if stat.kind == FileKind::File => {
                        if stat.size == desired.len() as u64 {
                            Some(context.connection.download_content(Path::new(&dest)).await?)
                        } else {
                            None
                        }
                    }
                    _ => None,
                };

                if current.as_deref() == Some(desired.as_slice()) {
                    false
                } else {
                    context.write_atomic(&dest, &desired).await?;
                    true
                }
            }
        };

        if let Some(stat) = context.stat(&dest).await? {
            changed |= apply_attributes(context, &dest, &attrs, &stat).await?;
        }

        let output = if changed {
            ModuleOutput::changed(format!("'{}' updated", dest))
        } else {
            ModuleOutput::ok(format!("'{}' already up to date", dest))
        };
        Ok(output.with_data("dest", json!(dest)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_identical_content_is_ok() {
        let conn = ScriptedConnection::new();
        conn.ok("stat -c", "644|root|root|regular file|5\n");
        conn.files
            .lock()
            .insert("/etc/motd".to_string(), b"hello".to_vec());

        let out = CopyModule
            .execute(&params(json!({"dest": "/etc/motd", "content": "hello"})), &context(&conn))
            .await
            .unwrap();
        assert!(!out.changed);
        assert!(!conn.ran("mv -f"));
    }

    #[tokio::test]
    async fn test_different_content_is_written() {
        let conn = ScriptedConnection::new();
        conn.ok("stat -c", "644|root|root|regular file|5\n");
        conn.files
            .lock()
            .insert("/etc/motd".to_string(), b"howdy".to_vec());

        let out = CopyModule
            .execute(&params(json!({"dest": "/etc/motd", "content": "hello"})), &context(&conn))
            .await
            .unwrap();
        assert!(out.changed);
        assert!(conn.ran("mv -f"));
    }

    #[tokio::test]
    async fn test_local_src_resolves_against_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("app.conf")).unwrap();
        write!(file, "port=80").unwrap();

        let conn = ScriptedConnection::new();
        conn.fail("stat -c", 1);
        let ctx = context(&conn).with_base_dir(dir.path());
        let out = CopyModule
            .execute(&params(json!({"dest": "/etc/app.conf", "src": "app.conf"})), &ctx)
            .await
            .unwrap();
        assert!(out.changed);
        let files = conn.files.lock();
        assert!(files.values().any(|c| c == b"port=80"));
    }

    #[tokio::test]
    async fn test_missing_local_src_is_precondition_failure() {
        let conn = ScriptedConnection::new();
        conn.fail("stat -c", 1);
        let err = CopyModule
            .execute(&params(json!({"dest": "/etc/x", "src": "/nonexistent/x"})), &context(&conn))
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::PreconditionFailed(_)));
    }

    #[tokio::test]
    async fn test_remote_src_unchanged_when_identical() {
        let conn = ScriptedConnection::new();
        conn.fail("stat -c", 1);
        conn.ok("cmp -s", "");
        let out = CopyModule
            .execute(
                &params(json!({"dest": "/etc/b", "src": "/etc/a", "remote_src": true})),
                &context(&conn),
            )
            .await
            .unwrap();
        assert!(!out.changed);
        assert!(!conn.ran("cp -p"));
    }

    #[tokio::test]
    async fn test_rewrite_keeps_existing_file_mode() {
        use crate::connection::local::LocalConnection;
        use std::os::unix::fs::PermissionsExt;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("motd");
        std::fs::write(&dest, "old\n").unwrap();
        std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o644)).unwrap();

        let ctx = ModuleContext::new("local", Arc::new(LocalConnection::new()));
        let dest_str = dest.display().to_string();
        let out = CopyModule
            .execute(&params(json!({"dest": dest_str, "content": "new\n"})), &ctx)
            .await
            .unwrap();

        assert!(out.changed);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "new\n");
        let mode = std::fs::metadata(&dest).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }

    #[test]
    fn test_content_and_src_are_exclusive() {
        assert!(CopyModule
            .validate_params(&params(json!({"dest": "/x", "content": "a", "src": "b"})))
            .is_err());
        assert!(CopyModule.validate_params(&params(json!({"dest": "/x"}))).is_err());
    }
}
