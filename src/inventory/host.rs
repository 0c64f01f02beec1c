//! Host definition for the Converge inventory.
//!
//! A `Host` is a managed node: an alias, the address to reach it at, its
//! connection parameters, host-level variables and the set of groups it
//! belongs to.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Transport used to reach a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// SSH connection (default)
    #[default]
    Ssh,
    /// Run on the control node
    Local,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Ssh => write!(f, "ssh"),
            Transport::Local => write!(f, "local"),
        }
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ssh" | "smart" => Ok(Transport::Ssh),
            "local" => Ok(Transport::Local),
            other => Err(format!("unsupported connection type '{}'", other)),
        }
    }
}

/// Connection parameters for a host.
///
/// Unset options fall back to play and configuration defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// Transport
    #[serde(default)]
    pub transport: Transport,

    /// SSH port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Login user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_user: Option<String>,

    /// Privilege escalation default for this host
    #[serde(default, rename = "become", skip_serializing_if = "Option::is_none")]
    pub r#become: Option<bool>,

    /// Escalation method (sudo, su, doas)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub become_method: Option<String>,

    /// User to become
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub become_user: Option<String>,

    /// Interpreter path on the remote host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,

    /// Shell executable on the remote host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
}

/// A managed host in the inventory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    /// Inventory alias
    pub name: String,

    /// Hostname or IP to connect to, when different from the alias
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Connection parameters
    #[serde(default)]
    pub connection: ConnectionParams,

    /// Host-specific variables
    #[serde(default)]
    pub vars: IndexMap<String, JsonValue>,

    /// Groups this host belongs to directly
    #[serde(default)]
    pub groups: BTreeSet<String>,
}

impl Host {
    /// Create a new host with the given alias
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: None,
            connection: ConnectionParams::default(),
            vars: IndexMap::new(),
            groups: BTreeSet::new(),
        }
    }

    /// Create a new host with hostname/IP
    pub fn with_address(name: impl Into<String>, address: impl Into<String>) -> Self {
        let mut host = Self::new(name);
        host.address = Some(address.into());
        host
    }

    /// A host that runs on the control node
    pub fn local(name: impl Into<String>) -> Self {
        let mut host = Self::new(name);
        host.connection.transport = Transport::Local;
        host
    }

    /// Get the actual address to connect to
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }

    /// Set a variable on this host
    pub fn set_var(&mut self, key: impl Into<String>, value: JsonValue) {
        self.vars.insert(key.into(), value);
    }

    /// Get a variable from this host
    pub fn get_var(&self, key: &str) -> Option<&JsonValue> {
        self.vars.get(key)
    }

    /// Add this host to a group
    pub fn add_to_group(&mut self, group: impl Into<String>) {
        self.groups.insert(group.into());
    }

    /// Check if host belongs to a specific group
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    /// Apply one inventory key. Connection keys set parameters; anything
    /// else becomes a host variable.
    pub(crate) fn apply_key(&mut self, key: &str, value: JsonValue) -> Result<(), String> {
        match key {
            "address" => self.address = Some(expect_string(key, value)?),
            "remote_user" => self.connection.remote_user = Some(expect_string(key, value)?),
            "port" => {
                let port = value
                    .as_u64()
                    .and_then(|p| u16::try_from(p).ok())
                    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                    .ok_or_else(|| format!("'port' must be a port number, got {}", value))?;
                self.connection.port = Some(port);
            }
            "connection" => {
                self.connection.transport = expect_string(key, value)?.parse()?;
            }
            "become" => {
                let flag = value
                    .as_bool()
                    .ok_or_else(|| format!("'become' must be a boolean, got {}", value))?;
                self.connection.r#become = Some(flag);
            }
            "become_method" => self.connection.become_method = Some(expect_string(key, value)?),
            "become_user" => self.connection.become_user = Some(expect_string(key, value)?),
            "interpreter" => self.connection.interpreter = Some(expect_string(key, value)?),
            "shell" => self.connection.shell = Some(expect_string(key, value)?),
            _ => {
                self.vars.insert(key.to_string(), value);
            }
        }
        Ok(())
    }
}

fn expect_string(key: &str, value: JsonValue) -> Result<String, String> {
    match value {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(format!("'{}' must be a string, got {}", key, other)),
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.address {
            Some(address) if address != &self.name => write!(f, "{} ({})", self.name, address),
            _ => write!(f, "{}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_address_falls_back_to_name() {
        let host = Host::new("web1");
        assert_eq!(host.address(), "web1");

        let host = Host::with_address("web1", "10.0.0.11");
        assert_eq!(host.address(), "10.0.0.11");
        assert_eq!(host.to_string(), "web1 (10.0.0.11)");
    }

    #[test]
    fn test_apply_connection_keys() {
        let mut host = Host::new("db1");
        host.apply_key("address", json!("10.0.0.5")).unwrap();
        host.apply_key("port", json!(2222)).unwrap();
        host.apply_key("remote_user", json!("deploy")).unwrap();
        host.apply_key("become", json!(true)).unwrap();
        host.apply_key("connection", json!("local")).unwrap();
        host.apply_key("pg_version", json!(15)).unwrap();

        assert_eq!(host.address(), "10.0.0.5");
        assert_eq!(host.connection.port, Some(2222));
        assert_eq!(host.connection.remote_user.as_deref(), Some("deploy"));
        assert_eq!(host.connection.r#become, Some(true));
        assert_eq!(host.connection.transport, Transport::Local);
        assert_eq!(host.get_var("pg_version"), Some(&json!(15)));
    }

    #[test]
    fn test_apply_rejects_bad_values() {
        let mut host = Host::new("db1");
        assert!(host.apply_key("port", json!("not-a-port")).is_err());
        assert!(host.apply_key("become", json!("yes please")).is_err());
        assert!(host.apply_key("connection", json!("winrm")).is_err());
    }
}
