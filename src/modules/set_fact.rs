//! Set_fact module - Set host variables dynamically during play execution
//!
//! Every parameter becomes a variable in the host's play-local scope, visible
//! to the tasks that follow on that host. Gathered facts are never modified.
//! Parameters arrive already rendered, so `{{ }}` expressions are stored as
//! their values.

use async_trait::async_trait;

use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult};

/// Module for setting host variables
pub struct SetFactModule;

#[async_trait]
impl Module for SetFactModule {
    fn name(&self) -> &'static str {
        "set_fact"
    }

    fn description(&self) -> &'static str {
        "Set host variables that persist for the rest of the play"
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        if params.is_empty() {
            return Err(ModuleError::InvalidParameter(
                "set_fact requires at least one key=value pair to set".to_string(),
            ));
        }
        if let Some(bad) = params.keys().find(|k| !is_identifier(k)) {
            return Err(ModuleError::InvalidParameter(format!(
                "'{}' is not a valid variable name",
                bad
            )));
        }
        Ok(())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        _context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let mut output = ModuleOutput::ok(format!("Set {} fact(s)", params.len()));
        for (key, value) in params {
            output.set_vars.insert(key.clone(), value.clone());
        }
        Ok(output)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_params_become_vars() {
        let conn = ScriptedConnection::new();
        let out = SetFactModule
            .execute(&params(json!({"release": "1.2", "ports": [80, 443]})), &context(&conn))
            .await
            .unwrap();
        assert!(!out.changed);
        assert_eq!(out.set_vars["release"], json!("1.2"));
        assert_eq!(out.set_vars["ports"], json!([80, 443]));
        assert!(conn.commands.lock().is_empty());
    }

    #[test]
    fn test_validation() {
        assert!(SetFactModule.validate_params(&params(json!({}))).is_err());
        assert!(SetFactModule.validate_params(&params(json!({"2fast": 1}))).is_err());
        assert!(SetFactModule.validate_params(&params(json!({"_ok": 1}))).is_ok());
    }
}
