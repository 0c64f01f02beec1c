//! Service module - manage systemd services
//!
//! `started` and `stopped` converge; `restarted` and `reloaded` always act
//! and always report a change. `enabled` is reconciled independently.

use async_trait::async_trait;
use serde_json::json;

use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::connection::shell_quote;

/// Desired service state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Started,
    Stopped,
    Restarted,
    Reloaded,
}

impl ServiceState {
    fn from_str(s: &str) -> ModuleResult<Self> {
        match s.to_lowercase().as_str() {
            "started" | "running" => Ok(ServiceState::Started),
            "stopped" => Ok(ServiceState::Stopped),
            "restarted" => Ok(ServiceState::Restarted),
            "reloaded" => Ok(ServiceState::Reloaded),
            _ => Err(ModuleError::InvalidParameter(format!(
                "Invalid state '{}'. Valid states: started, stopped, restarted, reloaded",
                s
            ))),
        }
    }
}

fn unit_name(name: &str) -> String {
    if name.contains('.') {
        name.to_string()
    } else {
        format!("{}.service", name)
    }
}

/// Module for service management
pub struct ServiceModule;

#[async_trait]
impl Module for ServiceModule {
    fn name(&self) -> &'static str {
        "service"
    }

    fn description(&self) -> &'static str {
        "Manage the run state and boot-time enablement of systemd services"
    }

    fn required_params(&self) -> &[&'static str] {
        &["name"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        let state = params.get_string("state")?;
        if let Some(state) = &state {
            ServiceState::from_str(state)?;
        }
        if state.is_none() && params.get_bool("enabled")?.is_none() {
            return Err(ModuleError::InvalidParameter(
                "one of 'state' or 'enabled' is required".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let name = params.get_string_required("name")?;
        let state = params
            .get_string("state")?
            .map(|s| ServiceState::from_str(&s))
            .transpose()?;
        let enabled = params.get_bool("enabled")?;
        let unit = shell_quote(&unit_name(&name));

        if !context
            .probe(&format!("systemctl cat -- {} >/dev/null 2>&1", unit))
            .await?
        {
            return Err(ModuleError::PreconditionFailed(format!(
                "service '{}' does not exist",
                name
            )));
        }

        let mut actions = Vec::new();

        if let Some(state) = state {
            let active = context
                .probe(&format!("systemctl is-active --quiet {}", unit))
                .await?;
            let action = match state {
                ServiceState::Started if !active => Some("start"),
                ServiceState::Stopped if active => Some("stop"),
                ServiceState::Restarted => Some("restart"),
                ServiceState::Reloaded => Some("reload"),
                _ => None,
            };
            if let Some(action) = action {
                context
                    .run_checked(&format!("systemctl {} {}", action, unit))
                    .await?;
                actions.push(action);
            }
        }

        if let Some(enabled) = enabled {
            let is_enabled = context
                .probe(&format!("systemctl is-enabled --quiet {}", unit))
                .await?;
            if is_enabled != enabled {
                let action = if enabled { "enable" } else { "disable" };
                context
                    .run_checked(&format!("systemctl {} {}", action, unit))
                    .await?;
                actions.push(action);
            }
        }

        let output = if actions.is_empty() {
            ModuleOutput::ok(format!("Service '{}' is already in the desired state", name))
        } else {
            ModuleOutput::changed(format!("Service '{}': {}", name, actions.join(", ")))
        };
        Ok(output
            .with_data("name", json!(name))
            .with_data("actions", json!(actions)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn test_started_is_idempotent() {
        let conn = ScriptedConnection::new();
        conn.ok("is-active", "");
        let out = ServiceModule
            .execute(&params(json!({"name": "nginx", "state": "started"})), &context(&conn))
            .await
            .unwrap();
        assert!(!out.changed);
        assert!(!conn.ran("systemctl start"));
    }

    #[tokio::test]
    async fn test_start_and_enable() {
        let conn = ScriptedConnection::new();
        conn.fail("is-active", 3);
        conn.fail("is-enabled", 1);
        let out = ServiceModule
            .execute(
                &params(json!({"name": "nginx", "state": "started", "enabled": true})),
                &context(&conn),
            )
            .await
            .unwrap();
        assert!(out.changed);
        assert!(conn.ran("systemctl start 'nginx.service'"));
        assert!(conn.ran("systemctl enable 'nginx.service'"));
    }

    #[tokio::test]
    async fn test_restarted_always_changes() {
        let conn = ScriptedConnection::new();
        let out = ServiceModule
            .execute(&params(json!({"name": "sshd", "state": "restarted"})), &context(&conn))
            .await
            .unwrap();
        assert!(out.changed);
        assert!(conn.ran("systemctl restart"));
    }

    #[tokio::test]
    async fn test_missing_unit_fails() {
        let conn = ScriptedConnection::new();
        conn.fail("systemctl cat", 1);
        let err = ServiceModule
            .execute(&params(json!({"name": "ghost", "state": "reloaded"})), &context(&conn))
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::PreconditionFailed(_)));
    }

    #[test]
    fn test_validate_requires_state_or_enabled() {
        assert!(ServiceModule.validate_params(&params(json!({"name": "x"}))).is_err());
        assert!(ServiceModule
            .validate_params(&params(json!({"name": "x", "enabled": false})))
            .is_ok());
        assert!(ServiceModule
            .validate_params(&params(json!({"name": "x", "state": "bouncing"})))
            .is_err());
    }
}
