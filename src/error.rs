//! Error types for Converge.
//!
//! Each component owns a focused error enum; this module folds them into one
//! crate-level [`Error`] so callers that drive a whole run can use `?`
//! throughout.

use std::path::PathBuf;
use thiserror::Error;

use crate::backup::BackupError;
use crate::connection::ConnectionError;
use crate::executor::ExecutorError;
use crate::inventory::InventoryError;
use crate::lookup::LookupError;
use crate::modules::ModuleError;
use crate::template::TemplateError;

/// Result type alias for Converge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Converge.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Playbook Errors
    // ========================================================================
    /// Error parsing a playbook file.
    #[error("Failed to parse playbook '{path}': {message}")]
    PlaybookParse {
        /// Path to the playbook file
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// Playbook structure is invalid.
    #[error("Playbook validation failed: {0}")]
    PlaybookValidation(String),

    // ========================================================================
    // Component Errors
    // ========================================================================
    /// Inventory loading or resolution failed.
    #[error(transparent)]
    Inventory(#[from] InventoryError),

    /// Template evaluation failed.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// A lookup could not be satisfied.
    #[error(transparent)]
    Lookup(#[from] LookupError),

    /// A module reported an error.
    #[error(transparent)]
    Module(#[from] ModuleError),

    /// Transport failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A run could not start.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// Backup selection failed.
    #[error(transparent)]
    Backup(#[from] BackupError),

    // ========================================================================
    // Configuration & IO Errors
    // ========================================================================
    /// Configuration is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Extra variables could not be parsed.
    #[error("Invalid extra variable '{0}'")]
    InvalidExtraVar(String),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a playbook parse error.
    pub fn playbook_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::PlaybookParse {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_playbook_parse_display() {
        let err = Error::playbook_parse("site.yml", "expected a sequence");
        assert_eq!(
            err.to_string(),
            "Failed to parse playbook 'site.yml': expected a sequence"
        );
    }

    #[test]
    fn test_component_errors_convert() {
        let err: Error = InventoryError::UnknownGroup("db".into()).into();
        assert!(matches!(err, Error::Inventory(InventoryError::UnknownGroup(_))));
        assert_eq!(err.to_string(), "Unknown group: db");
    }
}
