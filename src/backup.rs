//! Latest-artifact selection for timestamped backups.
//!
//! [`select_latest`] is a pure function over a list of [`ArchiveEntry`]
//! values. It picks the entry with the greatest sort key among those whose
//! name matches a glob pattern.
//!
//! # Ordering precondition
//!
//! When entries are keyed by name ([`SortKey::Name`]), "greatest name" only
//! means "newest" if every name embeds its timestamp at a fixed width with
//! zero padding, e.g. `app-20240115T093000.tar.gz`. Names produced by
//! [`timestamped_name`] always satisfy this. Selection warns when the
//! matched names carry timestamps of differing widths; callers that cannot
//! guarantee the convention should key entries by modification time instead
//! ([`ArchiveEntry::with_mtime`]).

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Format of the timestamp component embedded in archive names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

static TIMESTAMP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{8}T\d+)").expect("timestamp pattern is a valid regex")
});

/// Errors from backup selection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackupError {
    /// No entry matched the pattern.
    #[error("No archive matches pattern '{0}'")]
    NotFound(String),

    /// The name pattern is not a valid glob.
    #[error("Invalid name pattern '{pattern}': {message}")]
    InvalidPattern {
        /// The pattern as given
        pattern: String,
        /// Parser message
        message: String,
    },
}

/// What an entry is ordered by.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    /// Seconds since the epoch (mtime or ctime).
    Time(i64),
    /// The entry name itself.
    Name(String),
}

/// A filesystem entry considered for restore.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchiveEntry {
    /// Full path of the entry
    pub path: String,
    /// File name component
    pub name: String,
    /// Ordering key
    pub key: SortKey,
}

impl ArchiveEntry {
    /// An entry ordered by its file name.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = file_name(&path);
        Self {
            key: SortKey::Name(name.clone()),
            path,
            name,
        }
    }

    /// An entry ordered by a modification time.
    pub fn with_mtime(path: impl Into<String>, mtime: i64) -> Self {
        let path = path.into();
        Self {
            name: file_name(&path),
            path,
            key: SortKey::Time(mtime),
        }
    }
}

fn file_name(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

/// Return the newest entry whose name matches `name_pattern`.
///
/// Entries are ordered by key, then name, then path, so ties resolve the
/// same way on every call.
pub fn select_latest(
    entries: &[ArchiveEntry],
    name_pattern: &str,
) -> Result<ArchiveEntry, BackupError> {
    let pattern = glob::Pattern::new(name_pattern).map_err(|e| BackupError::InvalidPattern {
        pattern: name_pattern.to_string(),
        message: e.to_string(),
    })?;

    let mut matched: Vec<&ArchiveEntry> = entries
        .iter()
        .filter(|e| pattern.matches(&e.name))
        .collect();

    if matched.is_empty() {
        return Err(BackupError::NotFound(name_pattern.to_string()));
    }

    if matched.iter().any(|e| matches!(e.key, SortKey::Name(_)))
        && !has_uniform_timestamps(matched.iter().map(|e| e.name.as_str()))
    {
        warn!(
            pattern = %name_pattern,
            "archive names carry timestamps of differing width; name order may not be chronological"
        );
    }

    matched.sort_by(|a, b| {
        a.key
            .cmp(&b.key)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.path.cmp(&b.path))
    });

    Ok(matched[matched.len() - 1].clone())
}

/// Build `<prefix>-<YYYYMMDDTHHMMSS>.<ext>` for `at`.
pub fn timestamped_name(prefix: &str, at: DateTime<Utc>, ext: &str) -> String {
    format!("{}-{}.{}", prefix, at.format(TIMESTAMP_FORMAT), ext)
}

/// The timestamp component embedded in `name`, if any.
pub fn embedded_timestamp(name: &str) -> Option<&str> {
    TIMESTAMP_RE.find(name).map(|m| m.as_str())
}

/// Whether every name embeds a timestamp and all of them share one width.
pub fn has_uniform_timestamps<'a>(names: impl IntoIterator<Item = &'a str>) -> bool {
    let mut width = None;
    for name in names {
        let Some(ts) = embedded_timestamp(name) else {
            return false;
        };
        match width {
            None => width = Some(ts.len()),
            Some(w) if w != ts.len() => return false,
            Some(_) => {}
        }
    }
    true
}
