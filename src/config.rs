//! Configuration module for Converge
//!
//! Handles loading and merging configuration from multiple sources:
//! - Default values
//! - System configuration (/etc/converge/converge.toml)
//! - User configuration (~/.converge.toml)
//! - Project configuration (./converge.toml)
//! - Environment variables
//! - Command-line arguments (applied by the CLI last)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::executor::ExecutorConfig;
use crate::playbook::FailurePolicy;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default settings
    pub defaults: Defaults,

    /// Privilege escalation settings
    pub privilege_escalation: PrivilegeEscalation,

    /// SSH settings
    pub ssh: SshConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

/// Default execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    /// Inventory file used when none is given on the command line
    pub inventory: Option<PathBuf>,

    /// Number of hosts worked on concurrently
    pub forks: usize,

    /// Per-task timeout in seconds
    pub task_timeout: Option<u64>,

    /// Whole-play timeout in seconds
    pub play_timeout: Option<u64>,

    /// Gather facts unless a play says otherwise
    pub gather_facts: bool,

    /// What a failed task does to the rest of its host's tasks
    pub failure_policy: FailurePolicy,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            inventory: None,
            forks: 5,
            task_timeout: None,
            play_timeout: None,
            gather_facts: true,
            failure_policy: FailurePolicy::Strict,
        }
    }
}

/// Privilege escalation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivilegeEscalation {
    /// Escalate every task by default
    #[serde(rename = "become")]
    pub r#become: bool,

    /// Escalation method (sudo, su, doas)
    pub become_method: String,

    /// User to become
    pub become_user: String,
}

impl Default for PrivilegeEscalation {
    fn default() -> Self {
        Self {
            r#become: false,
            become_method: "sudo".to_string(),
            become_user: "root".to_string(),
        }
    }
}

/// SSH transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Port used when a host does not name one
    pub port: u16,

    /// Login user used when a host does not name one
    pub user: Option<String>,

    /// Private keys tried in order after the agent
    pub identity_files: Vec<String>,

    /// Try the SSH agent first
    pub use_agent: bool,

    /// Accept hosts missing from known_hosts
    pub accept_unknown_hosts: bool,

    /// TCP connect timeout in seconds
    pub connect_timeout: u64,

    /// Session inactivity timeout in seconds
    pub inactivity_timeout: u64,

    /// Password authentication fallback
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: 22,
            user: None,
            identity_files: Vec::new(),
            use_agent: true,
            accept_unknown_hosts: true,
            connect_timeout: 10,
            inactivity_timeout: 300,
            password: None,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when neither -v nor RUST_LOG is given
    pub level: Option<String>,

    /// Output format
    pub format: LogFormat,
}

impl Config {
    /// Load configuration from the standard locations, or only from
    /// `config_path` when one is given, then apply environment overrides.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut merged = toml::Table::new();

        for path in Self::get_config_paths(config_path) {
            if path.exists() {
                let table = Self::read_table(&path)?;
                merge_tables(&mut merged, table);
            } else if config_path.is_some() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
        }

        let mut config: Config = toml::Value::Table(merged)
            .try_into()
            .context("Invalid configuration")?;
        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse a single TOML file on top of the defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let table = Self::read_table(path.as_ref())?;
        toml::Value::Table(table)
            .try_into()
            .with_context(|| format!("Invalid configuration in {}", path.as_ref().display()))
    }

    fn get_config_paths(explicit_path: Option<&PathBuf>) -> Vec<PathBuf> {
        if let Some(path) = explicit_path {
            return vec![path.clone()];
        }

        let mut paths = vec![PathBuf::from("/etc/converge/converge.toml")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".converge.toml"));
        }
        paths.push(PathBuf::from("converge.toml"));
        paths
    }

    fn read_table(path: &Path) -> Result<toml::Table> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        // CONVERGE_FORKS
        if let Some(n) = env_parse("CONVERGE_FORKS") {
            self.defaults.forks = n;
        }

        // CONVERGE_TIMEOUT
        if let Some(n) = env_parse("CONVERGE_TIMEOUT") {
            self.defaults.task_timeout = Some(n);
        }

        // CONVERGE_PLAY_TIMEOUT
        if let Some(n) = env_parse("CONVERGE_PLAY_TIMEOUT") {
            self.defaults.play_timeout = Some(n);
        }

        // CONVERGE_FAILURE_POLICY
        if let Ok(policy) = std::env::var("CONVERGE_FAILURE_POLICY") {
            match policy.parse() {
                Ok(p) => self.defaults.failure_policy = p,
                Err(e) => tracing::warn!("Ignoring CONVERGE_FAILURE_POLICY: {}", e),
            }
        }

        // CONVERGE_REMOTE_USER
        if let Ok(user) = std::env::var("CONVERGE_REMOTE_USER") {
            self.ssh.user = Some(user);
        }

        // CONVERGE_PRIVATE_KEY_FILE
        if let Ok(key) = std::env::var("CONVERGE_PRIVATE_KEY_FILE") {
            self.ssh.identity_files.insert(0, key);
        }

        // CONVERGE_BECOME
        if let Ok(value) = std::env::var("CONVERGE_BECOME") {
            self.privilege_escalation.r#become = matches!(
                value.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }

        // CONVERGE_BECOME_METHOD
        if let Ok(method) = std::env::var("CONVERGE_BECOME_METHOD") {
            self.privilege_escalation.become_method = method;
        }

        // CONVERGE_BECOME_USER
        if let Ok(user) = std::env::var("CONVERGE_BECOME_USER") {
            self.privilege_escalation.become_user = user;
        }
    }

    /// Executor settings derived from this configuration.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            forks: self.defaults.forks.max(1),
            task_timeout: self.defaults.task_timeout,
            play_timeout: self.defaults.play_timeout,
            gather_facts: self.defaults.gather_facts,
            failure_policy: self.defaults.failure_policy,
            r#become: self.privilege_escalation.r#become,
            become_method: self.privilege_escalation.become_method.clone(),
            become_user: self.privilege_escalation.become_user.clone(),
            ..ExecutorConfig::default()
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Later tables win; nested tables merge key by key.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
