//! Shell module - Execute shell commands
//!
//! This module executes commands through a shell, enabling shell features
//! like pipes, redirects and environment variable expansion. Results follow
//! the command module: changed on success, failed on a nonzero exit.

use async_trait::async_trait;

use super::command::{check_guards, run_command_line};
use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::connection::shell_quote;

/// Module for executing shell commands
pub struct ShellModule;

impl ShellModule {
    fn script(params: &ModuleParams) -> ModuleResult<String> {
        let script = match params.get_string("cmd")? {
            Some(cmd) => cmd,
            None => params.get_string_required("_raw_params")?,
        };
        if script.trim().is_empty() {
            return Err(ModuleError::InvalidParameter(
                "command cannot be empty".to_string(),
            ));
        }
        Ok(script)
    }
}

#[async_trait]
impl Module for ShellModule {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn description(&self) -> &'static str {
        "Execute a command on the host through a shell"
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        Self::script(params).map(|_| ())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        if let Some(skipped) = check_guards(params, context).await? {
            return Ok(skipped);
        }
        let script = Self::script(params)?;
        let executable = params
            .get_string("executable")?
            .unwrap_or_else(|| "/bin/sh".to_string());
        let command = format!("{} -c {}", shell_quote(&executable), shell_quote(&script));
        run_command_line(&command, params, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_runs_through_sh() {
        let conn = ScriptedConnection::new();
        conn.ok("/bin/sh", "3\n");
        let out = ShellModule
            .execute(&params(json!({"_raw_params": "ls /etc | wc -l"})), &context(&conn))
            .await
            .unwrap();
        assert!(out.changed);
        assert_eq!(out.stdout.as_deref(), Some("3\n"));
        assert!(conn.ran("'/bin/sh' -c 'ls /etc | wc -l'"));
    }

    #[tokio::test]
    async fn test_custom_executable_and_chdir() {
        let conn = ScriptedConnection::new();
        ShellModule
            .execute(
                &params(json!({"cmd": "echo $PWD", "executable": "/bin/bash", "chdir": "/srv"})),
                &context(&conn),
            )
            .await
            .unwrap();
        assert!(conn.ran("'/bin/bash' -c 'echo $PWD'"));
    }

    #[test]
    fn test_empty_script_rejected() {
        assert!(ShellModule
            .validate_params(&params(json!({"cmd": "  "})))
            .is_err());
    }
}
