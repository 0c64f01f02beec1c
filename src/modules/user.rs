//! User module - User management
//!
//! This module manages user accounts on the host with the shadow-utils
//! commands (`useradd`, `usermod`, `userdel`).
//!
//! Supplementary groups follow one of two semantics. With `append: true`
//! the listed groups are added and other memberships are left alone; with
//! `append: false` (the default) the listed groups become the complete set
//! of supplementary groups.

use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeSet;

use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::connection::shell_quote;

/// Desired state for a user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserState {
    Present,
    Absent,
}

impl UserState {
    fn from_str(s: &str) -> ModuleResult<Self> {
        match s.to_lowercase().as_str() {
            "present" => Ok(UserState::Present),
            "absent" => Ok(UserState::Absent),
            _ => Err(ModuleError::InvalidParameter(format!(
                "Invalid state '{}'. Valid states: present, absent",
                s
            ))),
        }
    }
}

/// An account as reported by `getent passwd`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
}

impl UserInfo {
    pub fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.trim_end().split(':').collect();
        if parts.len() < 7 {
            return None;
        }
        Some(Self {
            name: parts[0].to_string(),
            uid: parts[2].parse().ok()?,
            gid: parts[3].parse().ok()?,
            home: parts[5].to_string(),
            shell: parts[6].to_string(),
        })
    }
}

/// Look up an account on the host
pub(crate) async fn lookup_user(context: &ModuleContext, name: &str) -> ModuleResult<Option<UserInfo>> {
    let result = context
        .run(&format!("getent passwd {}", shell_quote(name)))
        .await?;
    if !result.success {
        return Ok(None);
    }
    Ok(result.stdout.lines().next().and_then(UserInfo::parse))
}

/// Module for user management
pub struct UserModule;

impl UserModule {
    /// The primary group and the supplementary groups, i.e. every other
    /// group the user belongs to
    async fn group_membership(
        context: &ModuleContext,
        name: &str,
    ) -> ModuleResult<(String, BTreeSet<String>)> {
        let quoted = shell_quote(name);
        let all = context.run_checked(&format!("id -nG {}", quoted)).await?;
        let primary = context.run_checked(&format!("id -gn {}", quoted)).await?;
        let primary = primary.stdout.trim().to_string();
        let supplementary = all
            .stdout
            .split_whitespace()
            .filter(|g| *g != primary)
            .map(str::to_string)
            .collect();
        Ok((primary, supplementary))
    }

    fn create_command(
        name: &str,
        shell: Option<&str>,
        home: Option<&str>,
        create_home: bool,
        groups: &[String],
    ) -> String {
        let mut cmd = String::from("useradd");
        cmd.push_str(if create_home { " -m" } else { " -M" });
        if let Some(shell) = shell {
            cmd.push_str(&format!(" -s {}", shell_quote(shell)));
        }
        if let Some(home) = home {
            cmd.push_str(&format!(" -d {}", shell_quote(home)));
        }
        if !groups.is_empty() {
            cmd.push_str(&format!(" -G {}", shell_quote(&groups.join(","))));
        }
        cmd.push(' ');
        cmd.push_str(&shell_quote(name));
        cmd
    }
}

#[async_trait]
impl Module for UserModule {
    fn name(&self) -> &'static str {
        "user"
    }

    fn description(&self) -> &'static str {
        "Manage user accounts, login shells and group membership"
    }

    fn required_params(&self) -> &[&'static str] {
        &["name"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        if let Some(state) = params.get_string("state")? {
            UserState::from_str(&state)?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let name = params.get_string_required("name")?;
        let state = UserState::from_str(params.get_string("state")?.as_deref().unwrap_or("present"))?;
        let quoted = shell_quote(&name);
        let existing = lookup_user(context, &name).await?;

        if state == UserState::Absent {
            if existing.is_none() {
                return Ok(ModuleOutput::ok(format!("User '{}' does not exist", name)));
            }
            let remove = if params.get_bool_or("remove", false)? { " -r" } else { "" };
            context
                .run_checked(&format!("userdel{} {}", remove, quoted))
                .await?;
            return Ok(ModuleOutput::changed(format!("Removed user '{}'", name))
                .with_data("name", json!(name)));
        }

        let shell = params.get_string("shell")?;
        let home = params.get_string("home")?;
        let groups = params.get_vec_string("groups")?;
        let append = params.get_bool_or("append", false)?;

        let Some(info) = existing else {
            let cmd = Self::create_command(
                &name,
                shell.as_deref(),
                home.as_deref(),
                params.get_bool_or("create_home", true)?,
                groups.as_deref().unwrap_or_default(),
            );
            context.run_checked(&cmd).await?;
            return Ok(ModuleOutput::changed(format!("Created user '{}'", name))
                .with_data("name", json!(name)));
        };

        let mut changes = Vec::new();

        if let Some(shell) = &shell {
            if &info.shell != shell {
                context
                    .run_checked(&format!("usermod -s {} {}", shell_quote(shell), quoted))
                    .await?;
                changes.push("shell");
            }
        }

        if let Some(home) = &home {
            if &info.home != home {
                context
                    .run_checked(&format!("usermod -d {} {}", shell_quote(home), quoted))
                    .await?;
                changes.push("home");
            }
        }

        if let Some(groups) = &groups {
            let (primary, current) = Self::group_membership(context, &name).await?;
            // The primary group is never a supplementary one.
            let desired: BTreeSet<String> = groups
                .iter()
                .filter(|g| **g != primary)
                .cloned()
                .collect();
            if append {
                let missing: Vec<&str> = desired.difference(&current).map(String::as_str).collect();
                if !missing.is_empty() {
                    context
                        .run_checked(&format!(
                            "usermod -a -G {} {}",
                            shell_quote(&missing.join(",")),
                            quoted
                        ))
                        .await?;
                    changes.push("groups");
                }
            } else if desired != current {
                let joined = desired.iter().cloned().collect::<Vec<_>>().join(",");
                context
                    .run_checked(&format!("usermod -G {} {}", shell_quote(&joined), quoted))
                    .await?;
                changes.push("groups");
            }
        }

        let output = if changes.is_empty() {
            ModuleOutput::ok(format!("User '{}' is up to date", name))
        } else {
            ModuleOutput::changed(format!("Updated user '{}': {}", name, changes.join(", ")))
        };
        Ok(output
            .with_data("name", json!(name))
            .with_data("uid", json!(info.uid))
            .with_data("home", json!(info.home)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    const DEPLOY: &str = "deploy:x:1001:1001::/home/deploy:/bin/bash\n";

    #[test]
    fn test_user_info_parse() {
        let info = UserInfo::parse(DEPLOY).unwrap();
        assert_eq!(info.uid, 1001);
        assert_eq!(info.home, "/home/deploy");
        assert_eq!(info.shell, "/bin/bash");
        assert!(UserInfo::parse("broken:line").is_none());
    }

    #[tokio::test]
    async fn test_creates_missing_user() {
        let conn = ScriptedConnection::new();
        conn.fail("getent passwd", 2);
        let out = UserModule
            .execute(
                &params(json!({"name": "deploy", "shell": "/bin/bash", "groups": ["sudo", "www-data"]})),
                &context(&conn),
            )
            .await
            .unwrap();
        assert!(out.changed);
        assert!(conn.ran("useradd -m -s '/bin/bash' -G 'sudo,www-data' 'deploy'"));
    }

    #[tokio::test]
    async fn test_matching_user_is_ok() {
        let conn = ScriptedConnection::new();
        conn.ok("getent passwd", DEPLOY);
        conn.ok("id -nG", "deploy sudo\n");
        conn.ok("id -gn", "deploy\n");
        let out = UserModule
            .execute(
                &params(json!({"name": "deploy", "shell": "/bin/bash", "groups": ["sudo"]})),
                &context(&conn),
            )
            .await
            .unwrap();
        assert!(!out.changed);
        assert!(!conn.ran("usermod"));
    }

    #[tokio::test]
    async fn test_append_only_adds_missing() {
        let conn = ScriptedConnection::new();
        conn.ok("getent passwd", DEPLOY);
        conn.ok("id -nG", "deploy sudo docker\n");
        conn.ok("id -gn", "deploy\n");
        let out = UserModule
            .execute(
                &params(json!({"name": "deploy", "groups": ["sudo", "adm"], "append": true})),
                &context(&conn),
            )
            .await
            .unwrap();
        assert!(out.changed);
        assert!(conn.ran("usermod -a -G 'adm' 'deploy'"));
    }

    #[tokio::test]
    async fn test_replace_drops_unlisted_groups() {
        let conn = ScriptedConnection::new();
        conn.ok("getent passwd", DEPLOY);
        conn.ok("id -nG", "deploy sudo docker\n");
        conn.ok("id -gn", "deploy\n");
        let out = UserModule
            .execute(&params(json!({"name": "deploy", "groups": ["sudo"]})), &context(&conn))
            .await
            .unwrap();
        assert!(out.changed);
        assert!(conn.ran("usermod -G 'sudo' 'deploy'"));
    }

    #[tokio::test]
    async fn test_listing_primary_group_is_stable() {
        let conn = ScriptedConnection::new();
        conn.ok("getent passwd", DEPLOY);
        conn.ok("id -nG", "deploy docker\n");
        conn.ok("id -gn", "deploy\n");
        let out = UserModule
            .execute(
                &params(json!({"name": "deploy", "groups": ["deploy", "docker"], "append": false})),
                &context(&conn),
            )
            .await
            .unwrap();
        assert!(!out.changed);
        assert!(!conn.ran("usermod"));
    }

    #[tokio::test]
    async fn test_absent_user() {
        let conn = ScriptedConnection::new();
        conn.ok("getent passwd", DEPLOY);
        let out = UserModule
            .execute(
                &params(json!({"name": "deploy", "state": "absent", "remove": true})),
                &context(&conn),
            )
            .await
            .unwrap();
        assert!(out.changed);
        assert!(conn.ran("userdel -r 'deploy'"));
    }
}
