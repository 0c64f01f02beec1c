//! Command module - Execute arbitrary commands
//!
//! This module runs a command without shell interpretation: the command
//! line is split into words and each word is quoted before dispatch, so
//! pipes, redirects and variable expansion are passed through literally.
//! For shell features, use the shell module.
//!
//! Commands have no idempotency contract of their own. A zero exit reports
//! changed and a nonzero exit reports failed; `changed_when` and
//! `failed_when` on the task override either. The `creates` and `removes`
//! guards skip the command entirely.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::connection::shell_quote;

/// Check the `creates`/`removes` guards; `Some` means the command must not run.
pub(crate) async fn check_guards(
    params: &ModuleParams,
    context: &ModuleContext,
) -> ModuleResult<Option<ModuleOutput>> {
    if let Some(creates) = params.get_string("creates")? {
        if context.path_exists(&creates).await? {
            return Ok(Some(ModuleOutput::ok(format!(
                "Skipped, '{}' exists",
                creates
            ))));
        }
    }
    if let Some(removes) = params.get_string("removes")? {
        if !context.path_exists(&removes).await? {
            return Ok(Some(ModuleOutput::ok(format!(
                "Skipped, '{}' does not exist",
                removes
            ))));
        }
    }
    Ok(None)
}

/// Dispatch a prepared command line with `chdir` and `env` applied.
pub(crate) async fn run_command_line(
    command: &str,
    params: &ModuleParams,
    context: &ModuleContext,
) -> ModuleResult<ModuleOutput> {
    let mut options = context.options.clone();
    if let Some(chdir) = params.get_string("chdir")? {
        options = options.with_cwd(chdir);
    }
    if let Some(JsonValue::Object(env)) = params.get("env") {
        for (key, value) in env {
            let value = match value {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            options = options.with_env(key.clone(), value);
        }
    }

    let result = context.run_with(command, options).await?;
    let output = if result.success {
        ModuleOutput::changed("Command executed successfully")
    } else {
        ModuleOutput::failed(format!(
            "Command failed with exit code {}",
            result.exit_code
        ))
    };
    Ok(output.with_command_output(&result))
}

/// Module for executing commands directly
pub struct CommandModule;

impl CommandModule {
    fn build_command(params: &ModuleParams) -> ModuleResult<String> {
        let words = if let Some(argv) = params.get_vec_string("argv")? {
            argv
        } else {
            let cmd = match params.get_string("cmd")? {
                Some(cmd) => cmd,
                None => params.get_string_required("_raw_params")?,
            };
            shell_words::split(&cmd).map_err(|e| {
                ModuleError::InvalidParameter(format!("cannot parse command '{}': {}", cmd, e))
            })?
        };

        if words.is_empty() {
            return Err(ModuleError::InvalidParameter(
                "command cannot be empty".to_string(),
            ));
        }
        Ok(words
            .iter()
            .map(|w| shell_quote(w))
            .collect::<Vec<_>>()
            .join(" "))
    }
}

#[async_trait]
impl Module for CommandModule {
    fn name(&self) -> &'static str {
        "command"
    }

    fn description(&self) -> &'static str {
        "Execute a command on the host without a shell"
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        Self::build_command(params).map(|_| ())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        if let Some(skipped) = check_guards(params, context).await? {
            return Ok(skipped);
        }
        let command = Self::build_command(params)?;
        run_command_line(&command, params, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::connection::CommandResult;
    use serde_json::json;

    #[tokio::test]
    async fn test_words_are_quoted() {
        let conn = ScriptedConnection::new();
        conn.ok("'echo'", "hello world | tee\n");
        let out = CommandModule
            .execute(&params(json!({"cmd": "echo \"hello world\" | tee"})), &context(&conn))
            .await
            .unwrap();
        assert!(out.changed);
        assert_eq!(out.rc, Some(0));
        assert!(conn.ran("'echo' 'hello world' '|' 'tee'"));
    }

    #[tokio::test]
    async fn test_free_form_and_argv() {
        let conn = ScriptedConnection::new();
        CommandModule
            .execute(&params(json!({"_raw_params": "uptime"})), &context(&conn))
            .await
            .unwrap();
        CommandModule
            .execute(&params(json!({"argv": ["ls", "-l", "my dir"]})), &context(&conn))
            .await
            .unwrap();
        assert!(conn.ran("'uptime'"));
        assert!(conn.ran("'ls' '-l' 'my dir'"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed_output() {
        let conn = ScriptedConnection::new();
        conn.on("'false'", CommandResult::failure(1, String::new(), "nope".into()));
        let out = CommandModule
            .execute(&params(json!({"cmd": "false"})), &context(&conn))
            .await
            .unwrap();
        assert_eq!(out.status, super::super::ModuleStatus::Failed);
        assert_eq!(out.rc, Some(1));
        assert_eq!(out.stderr.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn test_creates_guard_skips() {
        let conn = ScriptedConnection::new();
        let out = CommandModule
            .execute(
                &params(json!({"cmd": "make install", "creates": "/usr/local/bin/app"})),
                &context(&conn),
            )
            .await
            .unwrap();
        assert!(!out.changed);
        assert!(!conn.ran("'make'"));
    }

    #[tokio::test]
    async fn test_removes_guard_skips_when_missing() {
        let conn = ScriptedConnection::new();
        conn.fail("test -e", 1);
        let out = CommandModule
            .execute(&params(json!({"cmd": "rm /tmp/lock", "removes": "/tmp/lock"})), &context(&conn))
            .await
            .unwrap();
        assert!(!out.changed);
        assert!(!conn.ran("'rm'"));
    }

    #[test]
    fn test_unbalanced_quotes_rejected() {
        assert!(CommandModule
            .validate_params(&params(json!({"cmd": "echo 'oops"})))
            .is_err());
        assert!(CommandModule.validate_params(&params(json!({}))).is_err());
    }
}
