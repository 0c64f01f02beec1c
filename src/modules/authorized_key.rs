//! Authorized key module - manage lines in a user's authorized_keys
//!
//! A key is present when its exact line (surrounding whitespace trimmed)
//! is in `~user/.ssh/authorized_keys`. The file is rewritten atomically,
//! then mode 0600 and ownership by the user are enforced.

use async_trait::async_trait;
use serde_json::json;

use super::user::lookup_user;
use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::connection::shell_quote;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    Present,
    Absent,
}

impl KeyState {
    fn from_param(state: Option<String>) -> ModuleResult<Self> {
        match state.as_deref().unwrap_or("present") {
            "present" => Ok(KeyState::Present),
            "absent" => Ok(KeyState::Absent),
            other => Err(ModuleError::InvalidParameter(format!(
                "state must be 'present' or 'absent', got '{}'",
                other
            ))),
        }
    }
}

/// Module for authorized_keys management
pub struct AuthorizedKeyModule;

#[async_trait]
impl Module for AuthorizedKeyModule {
    fn name(&self) -> &'static str {
        "authorized_key"
    }

    fn description(&self) -> &'static str {
        "Add or remove SSH public keys for a user"
    }

    fn required_params(&self) -> &[&'static str] {
        &["user", "key"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        KeyState::from_param(params.get_string("state")?)?;
        if params.get_string_required("key")?.trim().contains('\n') {
            return Err(ModuleError::InvalidParameter(
                "key must be a single line".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let user = params.get_string_required("user")?;
        let key = params.get_string_required("key")?.trim().to_string();
        let state = KeyState::from_param(params.get_string("state")?)?;

        let info = lookup_user(context, &user).await?.ok_or_else(|| {
            ModuleError::PreconditionFailed(format!("user '{}' does not exist", user))
        })?;
        let ssh_dir = format!("{}/.ssh", info.home.trim_end_matches('/'));
        let path = format!("{}/authorized_keys", ssh_dir);

        let current = if context.path_exists(&path).await? {
            context
                .run_checked(&format!("cat {}", shell_quote(&path)))
                .await?
                .stdout
        } else {
            String::new()
        };
        let lines: Vec<&str> = current.lines().collect();
        let present = lines.iter().any(|l| l.trim() == key);

        let updated: Option<String> = match state {
            KeyState::Present if !present => {
                let mut content = current.clone();
                if !content.is_empty() && !content.ends_with('\n') {
                    content.push('\n');
                }
                content.push_str(&key);
                content.push('\n');
                Some(content)
            }
            KeyState::Absent if present => {
                let kept: Vec<&str> = lines.into_iter().filter(|l| l.trim() != key).collect();
                let mut content = kept.join("\n");
                if !content.is_empty() {
                    content.push('\n');
                }
                Some(content)
            }
            _ => None,
        };

        let Some(content) = updated else {
            return Ok(ModuleOutput::ok(format!("authorized_keys for '{}' already up to date", user))
                .with_data("path", json!(path)));
        };

        let owner = shell_quote(&format!("{}:{}", user, info.gid));
        context
            .run_checked(&format!(
                "mkdir -p -- {d} && chmod 700 {d} && chown {o} {d}",
                d = shell_quote(&ssh_dir),
                o = owner
            ))
            .await?;
        context.write_atomic(&path, content.as_bytes()).await?;
        context
            .run_checked(&format!(
                "chmod 600 {p} && chown {o} {p}",
                p = shell_quote(&path),
                o = owner
            ))
            .await?;

        let verb = match state {
            KeyState::Present => "Added",
            KeyState::Absent => "Removed",
        };
        Ok(ModuleOutput::changed(format!("{} key for '{}'", verb, user))
            .with_data("path", json!(path)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::connection::CommandResult;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIGV4YW1wbGU deploy@laptop";

    fn deploy(conn: &ScriptedConnection) {
        conn.ok("getent passwd", "deploy:x:1001:1001::/home/deploy:/bin/bash\n");
    }

    #[tokio::test]
    async fn test_key_already_present() {
        let conn = ScriptedConnection::new();
        deploy(&conn);
        conn.ok("cat '/home/deploy/.ssh/authorized_keys'", &format!("ssh-rsa AAAA other\n{}\n", KEY));
        let out = AuthorizedKeyModule
            .execute(&params(json!({"user": "deploy", "key": KEY})), &context(&conn))
            .await
            .unwrap();
        assert!(!out.changed);
        assert!(conn.files.lock().is_empty());
    }

    #[tokio::test]
    async fn test_key_appended() {
        let conn = ScriptedConnection::new();
        deploy(&conn);
        conn.ok("cat '/home/deploy/.ssh/authorized_keys'", "ssh-rsa AAAA other");
        let out = AuthorizedKeyModule
            .execute(&params(json!({"user": "deploy", "key": KEY})), &context(&conn))
            .await
            .unwrap();
        assert!(out.changed);

        let files = conn.files.lock();
        let written = String::from_utf8(files.values().next().unwrap().clone()).unwrap();
        assert_eq!(written, format!("ssh-rsa AAAA other\n{}\n", KEY));
        assert!(conn.ran("chmod 600 '/home/deploy/.ssh/authorized_keys'"));
    }

    #[tokio::test]
    async fn test_key_removed() {
        let conn = ScriptedConnection::new();
        deploy(&conn);
        conn.ok("cat '/home/deploy/.ssh/authorized_keys'", &format!("{}\nssh-rsa AAAA other\n", KEY));
        let out = AuthorizedKeyModule
            .execute(
                &params(json!({"user": "deploy", "key": KEY, "state": "absent"})),
                &context(&conn),
            )
            .await
            .unwrap();
        assert!(out.changed);
        let files = conn.files.lock();
        assert_eq!(files.values().next().unwrap(), b"ssh-rsa AAAA other\n");
    }

    #[tokio::test]
    async fn test_unreadable_file_is_not_overwritten() {
        let conn = ScriptedConnection::new();
        deploy(&conn);
        conn.on(
            "cat '/home/deploy/.ssh/authorized_keys'",
            CommandResult::failure(
                1,
                String::new(),
                "cat: /home/deploy/.ssh/authorized_keys: Permission denied".to_string(),
            ),
        );
        let err = AuthorizedKeyModule
            .execute(&params(json!({"user": "deploy", "key": KEY})), &context(&conn))
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::PermissionDenied(_)));
        assert!(conn.files.lock().is_empty());
        assert!(!conn.ran("mv -f"));
    }

    #[tokio::test]
    async fn test_missing_file_is_created() {
        let conn = ScriptedConnection::new();
        deploy(&conn);
        conn.fail("test -e '/home/deploy/.ssh/authorized_keys'", 1);
        let out = AuthorizedKeyModule
            .execute(&params(json!({"user": "deploy", "key": KEY})), &context(&conn))
            .await
            .unwrap();
        assert!(out.changed);
        assert!(!conn.ran("cat '/home/deploy/.ssh/authorized_keys'"));
        let files = conn.files.lock();
        assert_eq!(files.values().next().unwrap(), format!("{}\n", KEY).as_bytes());
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let conn = ScriptedConnection::new();
        conn.fail("getent passwd", 2);
        let err = AuthorizedKeyModule
            .execute(&params(json!({"user": "ghost", "key": KEY})), &context(&conn))
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::PreconditionFailed(_)));
    }
}
