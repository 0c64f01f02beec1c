//! Find module - list filesystem entries matching name patterns
//!
//! Read-only: never reports a change. Results are ordered by `sort_by`
//! (`name`, `mtime` or `ctime`), oldest or lowest first.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::backup::{ArchiveEntry, SortKey};
use crate::connection::shell_quote;

/// One match reported by `find`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoundFile {
    pub path: String,
    pub name: String,
    pub mtime: i64,
    pub ctime: i64,
    pub size: u64,
}

impl FoundFile {
    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split('\t');
        let path = parts.next()?.to_string();
        let name = parts.next()?.to_string();
        let mtime = parse_epoch(parts.next()?)?;
        let ctime = parse_epoch(parts.next()?)?;
        let size = parts.next()?.trim().parse().ok()?;
        Some(Self {
            path,
            name,
            mtime,
            ctime,
            size,
        })
    }

    /// The entry as backup selector input, keyed by `sort_by`
    pub fn to_archive_entry(&self, sort_by: SortBy) -> ArchiveEntry {
        let mut entry = ArchiveEntry::new(self.path.clone());
        entry.key = match sort_by {
            SortBy::Name => SortKey::Name(self.name.clone()),
            SortBy::Mtime => SortKey::Time(self.mtime),
            SortBy::Ctime => SortKey::Time(self.ctime),
        };
        entry
    }
}

// find prints fractional seconds, e.g. 1700000000.1234567890
fn parse_epoch(field: &str) -> Option<i64> {
    field.split('.').next()?.trim().parse().ok()
}

/// Ordering applied to matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    #[default]
    Name,
    Mtime,
    Ctime,
}

impl SortBy {
    pub fn from_param(value: Option<String>) -> ModuleResult<Self> {
        match value.as_deref().unwrap_or("name") {
            "name" => Ok(SortBy::Name),
            "mtime" => Ok(SortBy::Mtime),
            "ctime" => Ok(SortBy::Ctime),
            other => Err(ModuleError::InvalidParameter(format!(
                "sort_by must be one of name, mtime, ctime; got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileType {
    File,
    Directory,
    Any,
}

impl FileType {
    fn from_param(value: Option<String>) -> ModuleResult<Self> {
        match value.as_deref().unwrap_or("file") {
            "file" => Ok(FileType::File),
            "directory" => Ok(FileType::Directory),
            "any" => Ok(FileType::Any),
            other => Err(ModuleError::InvalidParameter(format!(
                "file_type must be one of file, directory, any; got '{}'",
                other
            ))),
        }
    }
}

/// A search request
#[derive(Debug, Clone)]
pub(crate) struct FindQuery {
    pub paths: Vec<String>,
    pub patterns: Vec<String>,
    pub recurse: bool,
    file_type: FileType,
    pub sort_by: SortBy,
}

impl FindQuery {
    /// Non-recursive search for regular files under `path`
    pub(crate) fn files(path: impl Into<String>, pattern: impl Into<String>, sort_by: SortBy) -> Self {
        Self {
            paths: vec![path.into()],
            patterns: vec![pattern.into()],
            recurse: false,
            file_type: FileType::File,
            sort_by,
        }
    }

    fn from_params(params: &ModuleParams) -> ModuleResult<Self> {
        let paths = params
            .get_vec_string("paths")?
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ModuleError::MissingParameter("paths".to_string()))?;
        let patterns = params
            .get_vec_string("patterns")?
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| vec!["*".to_string()]);
        Ok(Self {
            paths,
            patterns,
            recurse: params.get_bool_or("recurse", false)?,
            file_type: FileType::from_param(params.get_string("file_type")?)?,
            sort_by: SortBy::from_param(params.get_string("sort_by")?)?,
        })
    }

    fn command(&self) -> String {
        let roots = self
            .paths
            .iter()
            .map(|p| shell_quote(p))
            .collect::<Vec<_>>()
            .join(" ");
        let names = self
            .patterns
            .iter()
            .map(|p| format!("-name {}", shell_quote(p)))
            .collect::<Vec<_>>()
            .join(" -o ");

        let mut cmd = format!("find {} -mindepth 1", roots);
        if !self.recurse {
            cmd.push_str(" -maxdepth 1");
        }
        match self.file_type {
            FileType::File => cmd.push_str(" -type f"),
            FileType::Directory => cmd.push_str(" -type d"),
            FileType::Any => {}
        }
        cmd.push_str(&format!(
            " \\( {} \\) -printf '%p\\t%f\\t%T@\\t%C@\\t%s\\n' 2>/dev/null",
            names
        ));
        cmd
    }
}

/// Run a search and return the matches in `sort_by` order.
///
/// Missing roots yield no matches rather than an error.
pub(crate) async fn find_files(
    context: &ModuleContext,
    query: &FindQuery,
) -> ModuleResult<Vec<FoundFile>> {
    let result = context.run(&query.command()).await?;
    let mut files: Vec<FoundFile> = result.stdout.lines().filter_map(FoundFile::parse).collect();
    match query.sort_by {
        SortBy::Name => files.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.path.cmp(&b.path))),
        SortBy::Mtime => files.sort_by(|a, b| a.mtime.cmp(&b.mtime).then_with(|| a.path.cmp(&b.path))),
        SortBy::Ctime => files.sort_by(|a, b| a.ctime.cmp(&b.ctime).then_with(|| a.path.cmp(&b.path))),
    }
    Ok(files)
}

/// Module for searching the host filesystem
pub struct FindModule;

#[async_trait]
impl Module for FindModule {
    fn name(&self) -> &'static str {
        "find"
    }

    fn description(&self) -> &'static str {
        "Find files matching name patterns, ordered by name or time"
    }

    fn required_params(&self) -> &[&'static str] {
        &["paths"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        FindQuery::from_params(params).map(|_| ())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let query = FindQuery::from_params(params)?;
        let files = find_files(context, &query).await?;
        Ok(ModuleOutput::ok(format!("{} file(s) matched", files.len()))
            .with_data("matched", json!(files.len()))
            .with_data("files", json!(files)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use pretty_assertions::assert_eq;

    const LISTING: &str = "\
/b/app-20240115T000000.tar.gz\tapp-20240115T000000.tar.gz\t1705276800.5\t1705276800.5\t2048
/b/app-20240101T000000.tar.gz\tapp-20240101T000000.tar.gz\t1706000000.0\t1704067200.0\t1024
";

    #[tokio::test]
    async fn test_sorted_by_name() {
        let conn = ScriptedConnection::new();
        conn.ok("find ", LISTING);
        let out = FindModule
            .execute(&params(json!({"paths": "/b", "patterns": "app-*.tar.gz"})), &context(&conn))
            .await
            .unwrap();

        assert!(!out.changed);
        assert_eq!(out.data["matched"], json!(2));
        assert_eq!(out.data["files"][0]["name"], json!("app-20240101T000000.tar.gz"));
        assert_eq!(out.data["files"][1]["size"], json!(2048));
        assert!(conn.ran("-maxdepth 1 -type f \\( -name 'app-*.tar.gz' \\)"));
    }

    #[tokio::test]
    async fn test_sorted_by_mtime() {
        let conn = ScriptedConnection::new();
        conn.ok("find ", LISTING);
        let files = find_files(
            &context(&conn),
            &FindQuery::files("/b", "*", SortBy::Mtime),
        )
        .await
        .unwrap();
        assert_eq!(files[0].name, "app-20240115T000000.tar.gz");
        assert_eq!(files[1].mtime, 1706000000);
    }

    #[tokio::test]
    async fn test_recurse_and_any_type() {
        let conn = ScriptedConnection::new();
        FindModule
            .execute(
                &params(json!({"paths": ["/a", "/b"], "recurse": true, "file_type": "any"})),
                &context(&conn),
            )
            .await
            .unwrap();
        let cmd = conn.commands.lock()[0].clone();
        assert!(cmd.starts_with("find '/a' '/b' -mindepth 1 \\("));
        assert!(!cmd.contains("-maxdepth"));
    }

    #[test]
    fn test_invalid_sort_by() {
        assert!(FindModule
            .validate_params(&params(json!({"paths": "/b", "sort_by": "size"})))
            .is_err());
    }

    #[test]
    fn test_archive_entry_keys() {
        let f = FoundFile::parse("/b/x.tar\tx.tar\t10.0\t20.0\t1").unwrap();
        assert_eq!(f.to_archive_entry(SortBy::Ctime).key, SortKey::Time(20));
        assert_eq!(f.to_archive_entry(SortBy::Name).key, SortKey::Name("x.tar".into()));
    }
}
