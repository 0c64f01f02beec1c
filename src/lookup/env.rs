//! Environment variable lookup.
//!
//! ```yaml
//! home: "{{ lookup('env', 'HOME') }}"
//! region: "{{ lookup('env', 'DEPLOY_REGION', 'default=eu-west-1') }}"
//! ```
//!
//! An unset variable yields the `default` option, or the empty string.

use super::{Lookup, LookupContext, LookupError, LookupResult};
use std::env;

/// Reads control-node environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvLookup;

impl EnvLookup {
    /// Create a new EnvLookup instance
    pub fn new() -> Self {
        Self
    }

    fn validate_var_name(&self, name: &str) -> LookupResult<()> {
        let valid = !name.is_empty()
            && !name.starts_with(|c: char| c.is_ascii_digit())
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if valid {
            Ok(())
        } else {
            Err(LookupError::InvalidArguments(format!(
                "invalid environment variable name '{}'",
                name
            )))
        }
    }
}

impl Lookup for EnvLookup {
    fn name(&self) -> &'static str {
        "env"
    }

    fn description(&self) -> &'static str {
        "Reads environment variables"
    }

    fn lookup(&self, args: &[&str], _context: &LookupContext) -> LookupResult<Vec<String>> {
        let options = self.parse_options(args);
        let default = options.get("default").cloned().unwrap_or_default();

        let names: Vec<&str> = args.iter().copied().filter(|a| !a.contains('=')).collect();
        if names.is_empty() {
            return Err(LookupError::MissingArgument(
                "environment variable name required".to_string(),
            ));
        }

        names
            .into_iter()
            .map(|name| {
                self.validate_var_name(name)?;
                Ok(env::var(name).unwrap_or_else(|_| default.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_lookup_set_variable() {
        env::set_var("CONVERGE_TEST_LOOKUP", "value");
        let values = EnvLookup::new()
            .lookup(&["CONVERGE_TEST_LOOKUP"], &LookupContext::default())
            .unwrap();
        assert_eq!(values, vec!["value".to_string()]);
        env::remove_var("CONVERGE_TEST_LOOKUP");
    }

    #[test]
    #[serial]
    fn test_env_lookup_unset_uses_default() {
        env::remove_var("CONVERGE_TEST_UNSET");
        let lookup = EnvLookup::new();
        let ctx = LookupContext::default();

        assert_eq!(lookup.lookup(&["CONVERGE_TEST_UNSET"], &ctx).unwrap(), vec![String::new()]);
        assert_eq!(
            lookup
                .lookup(&["CONVERGE_TEST_UNSET", "default=fallback"], &ctx)
                .unwrap(),
            vec!["fallback".to_string()]
        );
    }

    #[test]
    fn test_env_lookup_rejects_bad_names() {
        let result = EnvLookup::new().lookup(&["1BAD"], &LookupContext::default());
        assert!(matches!(result, Err(LookupError::InvalidArguments(_))));
    }
}
