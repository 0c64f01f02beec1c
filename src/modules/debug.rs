//! Debug module - Print debug messages and variable values
//!
//! Runs entirely on the control node and never reports a change. `msg` is
//! printed as given (after rendering); `var` names an expression that is
//! evaluated against the task's variables.

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tracing::info;

use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};

const UNDEFINED_MARKER: &str = "VARIABLE IS NOT DEFINED!";

/// Module for printing debug messages and variable values
pub struct DebugModule;

impl DebugModule {
    fn format_value(value: &JsonValue) -> String {
        match value {
            JsonValue::String(s) => s.clone(),
            _ => serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
        }
    }
}

#[async_trait]
impl Module for DebugModule {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn description(&self) -> &'static str {
        "Print a message or the value of a variable"
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        if params.contains_key("msg") && params.contains_key("var") {
            return Err(ModuleError::InvalidParameter(
                "'msg' and 'var' are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        if let Some(var) = params.get_string("var")? {
            let value = context
                .engine
                .evaluate(&var, &context.vars)
                .map_err(|e| ModuleError::InvalidParameter(e.to_string()))?
                .to_json()
                .unwrap_or_else(|| json!(UNDEFINED_MARKER));
            let shown = Self::format_value(&value);
            info!(host = %context.host, "{} = {}", var, shown);
            return Ok(ModuleOutput::ok(format!("{}: {}", var, shown)).with_data(var, value));
        }

        let msg = match params.get("msg") {
            Some(value) => Self::format_value(value),
            None => "Hello world!".to_string(),
        };
        info!(host = %context.host, "{}", msg);
        Ok(ModuleOutput::ok(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::template::Vars;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_default_message() {
        let conn = ScriptedConnection::new();
        let out = DebugModule.execute(&ModuleParams::new(), &context(&conn)).await.unwrap();
        assert_eq!(out.msg, "Hello world!");
        assert!(!out.changed);
    }

    #[tokio::test]
    async fn test_var_is_evaluated() {
        let conn = ScriptedConnection::new();
        let mut vars = Vars::new();
        vars.insert("result".into(), json!({"rc": 0, "stdout": "up 3 days"}));
        let ctx = context(&conn).with_vars(Arc::new(vars));

        let out = DebugModule
            .execute(&params(json!({"var": "result.stdout"})), &ctx)
            .await
            .unwrap();
        assert_eq!(out.data["result.stdout"], json!("up 3 days"));
        assert!(!out.changed);
    }

    #[tokio::test]
    async fn test_undefined_var_is_reported() {
        let conn = ScriptedConnection::new();
        let out = DebugModule
            .execute(&params(json!({"var": "nope"})), &context(&conn))
            .await
            .unwrap();
        assert_eq!(out.data["nope"], json!(UNDEFINED_MARKER));
    }
}
