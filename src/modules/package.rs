//! Package module - generic package management
//!
//! The package manager is chosen once per host from the OS family found
//! during fact gathering; the `use` parameter overrides it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;

use super::{Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::connection::shell_quote;
use crate::facts::OsFamily;

/// Supported package managers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Apt,
    Dnf,
    Pacman,
    Zypper,
    Apk,
    Brew,
}

impl PackageManager {
    /// Package manager native to an OS family
    pub fn for_family(family: OsFamily) -> Option<Self> {
        match family {
            OsFamily::Debian => Some(PackageManager::Apt),
            OsFamily::RedHat => Some(PackageManager::Dnf),
            OsFamily::Archlinux => Some(PackageManager::Pacman),
            OsFamily::Suse => Some(PackageManager::Zypper),
            OsFamily::Alpine => Some(PackageManager::Apk),
            OsFamily::Darwin => Some(PackageManager::Brew),
            OsFamily::Unknown => None,
        }
    }

    /// Command that exits zero iff `name` is installed
    pub fn query_command(&self, name: &str) -> String {
        let name = shell_quote(name);
        match self {
            PackageManager::Apt => format!(
                "dpkg-query -W -f='${{Status}}' {} 2>/dev/null | grep -q 'install ok installed'",
                name
            ),
            PackageManager::Dnf | PackageManager::Zypper => format!("rpm -q {} >/dev/null 2>&1", name),
            PackageManager::Pacman => format!("pacman -Q {} >/dev/null 2>&1", name),
            PackageManager::Apk => format!("apk info -e {} >/dev/null 2>&1", name),
            PackageManager::Brew => format!("brew list --versions {} >/dev/null 2>&1", name),
        }
    }

    /// Command installing every package in `names`
    pub fn install_command(&self, names: &[String]) -> String {
        let names = quote_all(names);
        match self {
            PackageManager::Apt => {
                format!("DEBIAN_FRONTEND=noninteractive apt-get install -y -q {}", names)
            }
            PackageManager::Dnf => format!("dnf install -y -q {}", names),
            PackageManager::Pacman => format!("pacman -S --noconfirm --needed {}", names),
            PackageManager::Zypper => format!("zypper --non-interactive install {}", names),
            PackageManager::Apk => format!("apk add --quiet {}", names),
            PackageManager::Brew => format!("brew install {}", names),
        }
    }

    /// Command removing every package in `names`
    pub fn remove_command(&self, names: &[String]) -> String {
        let names = quote_all(names);
        match self {
            PackageManager::Apt => {
                format!("DEBIAN_FRONTEND=noninteractive apt-get remove -y -q {}", names)
            }
            PackageManager::Dnf => format!("dnf remove -y -q {}", names),
            PackageManager::Pacman => format!("pacman -R --noconfirm {}", names),
            PackageManager::Zypper => format!("zypper --non-interactive remove {}", names),
            PackageManager::Apk => format!("apk del --quiet {}", names),
            PackageManager::Brew => format!("brew uninstall {}", names),
        }
    }
}

fn quote_all(names: &[String]) -> String {
    names.iter().map(|n| shell_quote(n)).collect::<Vec<_>>().join(" ")
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PackageManager::Apt => "apt",
            PackageManager::Dnf => "dnf",
            PackageManager::Pacman => "pacman",
            PackageManager::Zypper => "zypper",
            PackageManager::Apk => "apk",
            PackageManager::Brew => "brew",
        };
        f.write_str(name)
    }
}

impl FromStr for PackageManager {
    type Err = ModuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "apt" => Ok(PackageManager::Apt),
            "dnf" | "yum" => Ok(PackageManager::Dnf),
            "pacman" => Ok(PackageManager::Pacman),
            "zypper" => Ok(PackageManager::Zypper),
            "apk" => Ok(PackageManager::Apk),
            "brew" | "homebrew" => Ok(PackageManager::Brew),
            other => Err(ModuleError::InvalidParameter(format!(
                "unsupported package manager '{}'",
                other
            ))),
        }
    }
}

/// Desired package state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PackageState {
    Present,
    Absent,
}

impl PackageState {
    fn from_param(state: Option<String>) -> ModuleResult<Self> {
        match state.as_deref().unwrap_or("present") {
            "present" | "installed" => Ok(PackageState::Present),
            "absent" | "removed" => Ok(PackageState::Absent),
            other => Err(ModuleError::InvalidParameter(format!(
                "state must be 'present' or 'absent', got '{}'",
                other
            ))),
        }
    }
}

/// Module for installing and removing packages
pub struct PackageModule;

#[async_trait]
impl Module for PackageModule {
    fn name(&self) -> &'static str {
        "package"
    }

    fn description(&self) -> &'static str {
        "Install or remove packages with the host's package manager"
    }

    fn required_params(&self) -> &[&'static str] {
        &["name"]
    }

    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        PackageState::from_param(params.get_string("state")?)?;
        if let Some(manager) = params.get_string("use")? {
            manager.parse::<PackageManager>()?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let names = params
            .get_vec_string("name")?
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ModuleError::MissingParameter("name".to_string()))?;
        let state = PackageState::from_param(params.get_string("state")?)?;

        let manager = match params.get_string("use")? {
            Some(explicit) => explicit.parse()?,
            None => context.facts.package_manager().ok_or_else(|| {
                ModuleError::PreconditionFailed(format!(
                    "no package manager known for OS family {}",
                    context.facts.os_family()
                ))
            })?,
        };

        let mut pending = Vec::new();
        for name in &names {
            let installed = context.probe(&manager.query_command(name)).await?;
            if installed != (state == PackageState::Present) {
                pending.push(name.clone());
            }
        }

        if pending.is_empty() {
            return Ok(ModuleOutput::ok(match state {
                PackageState::Present => "All packages already installed",
                PackageState::Absent => "No packages to remove",
            })
            .with_data("packages", json!([])));
        }

        let (command, verb) = match state {
            PackageState::Present => (manager.install_command(&pending), "Installed"),
            PackageState::Absent => (manager.remove_command(&pending), "Removed"),
        };
        let result = context.run_checked(&command).await?;

        Ok(
            ModuleOutput::changed(format!("{} {}", verb, pending.join(", ")))
                .with_command_output(&result)
                .with_data("packages", json!(pending))
                .with_data("manager", json!(manager.to_string())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::facts::Facts;
    use std::sync::Arc;

    fn debian_facts() -> Arc<Facts> {
        Arc::new(
            Facts::from_probe("system=Linux\nepoch=1700000000\nID=debian\n").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_present_package_is_ok() {
        let conn = ScriptedConnection::new();
        conn.ok("dpkg-query", "");
        let ctx = context(&conn).with_facts(debian_facts());

        let out = PackageModule
            .execute(&params(json!({"name": "nginx"})), &ctx)
            .await
            .unwrap();
        assert!(!out.changed);
        assert!(!conn.ran("apt-get install"));
    }

    #[tokio::test]
    async fn test_missing_package_is_installed() {
        let conn = ScriptedConnection::new();
        conn.fail("dpkg-query", 1);
        let ctx = context(&conn).with_facts(debian_facts());

        let out = PackageModule
            .execute(&params(json!({"name": ["nginx", "curl"], "state": "present"})), &ctx)
            .await
            .unwrap();
        assert!(out.changed);
        assert!(conn.ran("apt-get install -y -q 'nginx' 'curl'"));
    }

    #[tokio::test]
    async fn test_absent_only_removes_installed() {
        let conn = ScriptedConnection::new();
        conn.ok("rpm -q 'telnet'", "");
        conn.fail("rpm -q", 1);
        let ctx = context(&conn);

        let out = PackageModule
            .execute(
                &params(json!({"name": ["telnet", "rsh"], "state": "absent", "use": "dnf"})),
                &ctx,
            )
            .await
            .unwrap();
        assert!(out.changed);
        assert!(conn.ran("dnf remove -y -q 'telnet'"));
        assert!(!conn.ran("remove -y -q 'telnet' 'rsh'"));
    }

    #[tokio::test]
    async fn test_unknown_family_is_precondition_failure() {
        let conn = ScriptedConnection::new();
        let ctx = context(&conn);
        let err = PackageModule
            .execute(&params(json!({"name": "nginx"})), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::PreconditionFailed(_)));
    }

    #[test]
    fn test_manager_for_family() {
        assert_eq!(PackageManager::for_family(OsFamily::Alpine), Some(PackageManager::Apk));
        assert_eq!(PackageManager::for_family(OsFamily::Unknown), None);
        assert_eq!("yum".parse::<PackageManager>().unwrap(), PackageManager::Dnf);
    }
}
