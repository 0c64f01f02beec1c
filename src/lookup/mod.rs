//! Lookup plugins for template expressions.
//!
//! A lookup is the only way a template may reach outside its variable
//! scope. Expressions call them as `lookup('kind', arg, ...)`; each plugin
//! returns one string per resolved value.
//!
//! # Available Plugins
//!
//! - [`FileLookup`] - Read a file on the control node
//! - [`EnvLookup`] - Read a control-node environment variable
//!
//! ```rust,ignore
//! use converge::lookup::{LookupContext, LookupRegistry};
//!
//! let registry = LookupRegistry::with_builtins();
//! let context = LookupContext::new().with_base_dir("/srv/playbooks");
//! let key = registry.lookup_first("file", &["files/id_ed25519.pub"], &context)?;
//! ```

pub mod env;
pub mod file;

pub use env::EnvLookup;
pub use file::FileLookup;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during lookup operations
#[derive(Error, Debug)]
pub enum LookupError {
    /// Lookup plugin not found
    #[error("Lookup plugin not found: {0}")]
    NotFound(String),

    /// Invalid arguments provided to lookup
    #[error("Invalid lookup arguments: {0}")]
    InvalidArguments(String),

    /// Missing required argument
    #[error("Missing required argument: {0}")]
    MissingArgument(String),

    /// File not found
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    /// File exists but could not be read
    #[error("Failed to read {path}: {source}")]
    Unreadable {
        /// The file that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Lookup produced nothing
    #[error("{0}")]
    Other(String),
}

/// Result type for lookup operations
pub type LookupResult<T> = Result<T, LookupError>;

/// Context for lookup plugin execution
#[derive(Debug, Clone, Default)]
pub struct LookupContext {
    /// Base directory for relative file paths
    pub base_dir: Option<PathBuf>,
}

impl LookupContext {
    /// Create a new lookup context
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base directory for relative paths
    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(base_dir.into());
        self
    }
}

/// Trait that all lookup plugins must implement
pub trait Lookup: Send + Sync {
    /// Returns the name of the lookup plugin
    fn name(&self) -> &'static str;

    /// Returns a description of what this lookup does
    fn description(&self) -> &'static str;

    /// Execute the lookup with the given arguments.
    ///
    /// Returns one string per resolved value.
    fn lookup(&self, args: &[&str], context: &LookupContext) -> LookupResult<Vec<String>>;

    /// Parse key=value arguments from the args list
    fn parse_options(&self, args: &[&str]) -> HashMap<String, String> {
        args.iter()
            .filter_map(|arg| arg.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

/// Registry of lookup plugins, keyed by name.
pub struct LookupRegistry {
    plugins: HashMap<String, Arc<dyn Lookup>>,
}

impl LookupRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// Create a registry holding the built-in plugins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FileLookup::new()));
        registry.register(Arc::new(EnvLookup::new()));
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn Lookup>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Lookup>> {
        self.plugins.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.keys().map(|s| s.as_str()).collect()
    }

    /// Run the named plugin.
    pub fn lookup(
        &self,
        name: &str,
        args: &[&str],
        context: &LookupContext,
    ) -> LookupResult<Vec<String>> {
        let plugin = self
            .get(name)
            .ok_or_else(|| LookupError::NotFound(name.to_string()))?;
        plugin.lookup(args, context)
    }

    /// Run the named plugin and keep its first value.
    pub fn lookup_first(
        &self,
        name: &str,
        args: &[&str],
        context: &LookupContext,
    ) -> LookupResult<String> {
        self.lookup(name, args, context)?
            .into_iter()
            .next()
            .ok_or_else(|| LookupError::Other(format!("lookup '{}' returned no results", name)))
    }
}

impl Default for LookupRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for LookupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = self.names();
        names.sort_unstable();
        f.debug_struct("LookupRegistry").field("plugins", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_with_builtins() {
        let registry = LookupRegistry::with_builtins();
        assert!(registry.contains("file"));
        assert!(registry.contains("env"));
        assert!(!registry.contains("url"));
    }

    #[test]
    fn test_registry_not_found() {
        let registry = LookupRegistry::new();
        let context = LookupContext::default();

        let result = registry.lookup("nonexistent", &[], &context);
        assert!(matches!(result, Err(LookupError::NotFound(_))));
    }

    #[test]
    fn test_parse_options() {
        struct TestLookup;
        impl Lookup for TestLookup {
            fn name(&self) -> &'static str {
                "test"
            }
            fn description(&self) -> &'static str {
                "Test lookup"
            }
            fn lookup(&self, _args: &[&str], _context: &LookupContext) -> LookupResult<Vec<String>> {
                Ok(vec![])
            }
        }

        let options = TestLookup.parse_options(&["key1=value1", "key2=value2", "no_equals"]);
        assert_eq!(options.get("key1"), Some(&"value1".to_string()));
        assert_eq!(options.get("key2"), Some(&"value2".to_string()));
        assert!(!options.contains_key("no_equals"));
    }

    #[test]
    fn test_lookup_first_empty_result() {
        struct Empty;
        impl Lookup for Empty {
            fn name(&self) -> &'static str {
                "empty"
            }
            fn description(&self) -> &'static str {
                "Returns nothing"
            }
            fn lookup(&self, _args: &[&str], _context: &LookupContext) -> LookupResult<Vec<String>> {
                Ok(vec![])
            }
        }

        let mut registry = LookupRegistry::new();
        registry.register(Arc::new(Empty));
        let err = registry
            .lookup_first("empty", &[], &LookupContext::new())
            .unwrap_err();
        assert!(matches!(err, LookupError::Other(_)));
    }
}
