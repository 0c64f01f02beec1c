//! Shared test utilities and fixtures for the Converge test suite.
//!
//! This module provides:
//! - A scripted [`MockConnection`] with a command log, a virtual filesystem,
//!   escalation denial and transport failure switches
//! - A [`MockConnectionFactory`] handing out one mock per host
//! - Inventory and fact-probe fixtures
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use converge::connection::{
    CommandResult, Connection, ConnectionError, ConnectionFactory, ConnectionResult,
    ExecuteOptions, TransferOptions,
};
use converge::executor::{Executor, ExecutorConfig};
use converge::inventory::{Host, Inventory};

/// Fact probe output of a Debian-family host
pub const DEBIAN_PROBE: &str = "system=Linux
architecture=x86_64
hostname=web
epoch=1705312800
NAME=\"Debian GNU/Linux\"
ID=debian
VERSION_ID=\"12\"
";

/// Handler consulted before the static rules. Returning `None` passes the
/// command on.
pub type CommandHandler =
    Box<dyn Fn(&MockConnection, &str, &ExecuteOptions) -> Option<CommandResult> + Send + Sync>;

/// A mock connection for integration tests.
///
/// Commands are answered, in order, by: the transport failure switch, the
/// escalation denial switch, the fact probe, registered handlers, `test -e`
/// against the virtual filesystem, then the first rule whose needle occurs
/// in the command. Anything else succeeds with empty output.
pub struct MockConnection {
    identifier: String,
    commands_executed: RwLock<Vec<String>>,
    escalated_commands: RwLock<Vec<String>>,
    rules: RwLock<Vec<(String, CommandResult)>>,
    delays: RwLock<Vec<(String, Duration)>>,
    handlers: RwLock<Vec<CommandHandler>>,
    virtual_paths: RwLock<HashSet<String>>,
    virtual_files: RwLock<HashMap<String, Vec<u8>>>,
    probe_output: RwLock<String>,
    should_fail: AtomicBool,
    deny_escalation: AtomicBool,
    fail_fact_probe: AtomicBool,
    command_count: AtomicU32,
    closed: AtomicU32,
}

impl MockConnection {
    /// Create a new mock connection with the given identifier.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            commands_executed: RwLock::new(Vec::new()),
            escalated_commands: RwLock::new(Vec::new()),
            rules: RwLock::new(Vec::new()),
            delays: RwLock::new(Vec::new()),
            handlers: RwLock::new(Vec::new()),
            virtual_paths: RwLock::new(HashSet::new()),
            virtual_files: RwLock::new(HashMap::new()),
            probe_output: RwLock::new(DEBIAN_PROBE.to_string()),
            should_fail: AtomicBool::new(false),
            deny_escalation: AtomicBool::new(false),
            fail_fact_probe: AtomicBool::new(false),
            command_count: AtomicU32::new(0),
            closed: AtomicU32::new(0),
        }
    }

    /// Answer commands containing `needle` with `result`.
    pub fn on(&self, needle: impl Into<String>, result: CommandResult) {
        self.rules.write().push((needle.into(), result));
    }

    /// Answer commands containing `needle` with success and `stdout`.
    pub fn on_ok(&self, needle: impl Into<String>, stdout: &str) {
        self.on(needle, CommandResult::success(stdout.to_string(), String::new()));
    }

    /// Answer commands containing `needle` with exit code `code`.
    pub fn on_fail(&self, needle: impl Into<String>, code: i32) {
        self.on(needle, CommandResult::failure(code, String::new(), String::new()));
    }

    /// Hold commands containing `needle` for `delay` before answering.
    pub fn slow_on(&self, needle: impl Into<String>, delay: Duration) {
        self.delays.write().push((needle.into(), delay));
    }

    /// Register a handler that sees every command before the rules.
    pub fn handle<F>(&self, handler: F)
    where
        F: Fn(&MockConnection, &str, &ExecuteOptions) -> Option<CommandResult> + Send + Sync + 'static,
    {
        self.handlers.write().push(Box::new(handler));
    }

    /// Make every operation fail at the transport level.
    pub fn set_should_fail(&self, should_fail: bool) {
        self.should_fail.store(should_fail, Ordering::SeqCst);
    }

    /// Refuse every escalated command.
    pub fn deny_escalation(&self) {
        self.deny_escalation.store(true, Ordering::SeqCst);
    }

    /// Make the fact probe exit nonzero.
    pub fn fail_fact_probe(&self) {
        self.fail_fact_probe.store(true, Ordering::SeqCst);
    }

    pub fn set_probe_output(&self, output: &str) {
        *self.probe_output.write() = output.to_string();
    }

    /// Mark a path as existing for `test -e`.
    pub fn add_path(&self, path: impl Into<String>) {
        self.virtual_paths.write().insert(path.into());
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.virtual_paths.read().contains(path)
    }

    /// Get the number of commands executed.
    pub fn command_count(&self) -> u32 {
        self.command_count.load(Ordering::SeqCst)
    }

    /// Get all commands that were executed.
    pub fn get_commands(&self) -> Vec<String> {
        self.commands_executed.read().clone()
    }

    /// Commands that ran with escalation, the escalation probe included.
    pub fn get_escalated_commands(&self) -> Vec<String> {
        self.escalated_commands.read().clone()
    }

    /// Whether any command containing `needle` ran.
    pub fn ran(&self, needle: &str) -> bool {
        self.commands_executed
            .read()
            .iter()
            .any(|c| c.contains(needle))
    }

    /// How many commands containing `needle` ran.
    pub fn count(&self, needle: &str) -> usize {
        self.commands_executed
            .read()
            .iter()
            .filter(|c| c.contains(needle))
            .count()
    }

    pub fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        self.virtual_files.read().get(path).cloned()
    }

    pub fn close_count(&self) -> u32 {
        self.closed.load(Ordering::SeqCst)
    }

    /// Forget executed commands.
    pub fn reset_log(&self) {
        self.commands_executed.write().clear();
        self.escalated_commands.write().clear();
        self.command_count.store(0, Ordering::SeqCst);
    }

    fn answer(&self, command: &str, options: &ExecuteOptions) -> CommandResult {
        if options.escalate && self.deny_escalation.load(Ordering::SeqCst) {
            return CommandResult::failure(1, String::new(), "sudo: a password is required".into());
        }
        if command.contains("uname -s") {
            if self.fail_fact_probe.load(Ordering::SeqCst) {
                return CommandResult::failure(127, String::new(), "sh: not found".into());
            }
            return CommandResult::success(self.probe_output.read().clone(), String::new());
        }
        for handler in self.handlers.read().iter() {
            if let Some(result) = handler(self, command, options) {
                return result;
            }
        }
        if let Some(path) = command.strip_prefix("test -e ") {
            let path = path.trim().trim_matches('\'');
            return if self.has_path(path) {
                CommandResult::success(String::new(), String::new())
            } else {
                CommandResult::failure(1, String::new(), String::new())
            };
        }
        self.rules
            .read()
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, result)| result.clone())
            .unwrap_or_else(|| CommandResult::success(String::new(), String::new()))
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn is_alive(&self) -> bool {
        !self.should_fail.load(Ordering::SeqCst)
    }

    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectionClosed);
        }
        let options = options.unwrap_or_default();
        self.command_count.fetch_add(1, Ordering::SeqCst);
        self.commands_executed.write().push(command.to_string());
        if options.escalate {
            self.escalated_commands.write().push(command.to_string());
        }
        let delay = self
            .delays
            .read()
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, delay)| *delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.answer(command, &options))
    }

    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        _options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectionClosed);
        }
        let path = remote_path.to_string_lossy().into_owned();
        self.virtual_files.write().insert(path.clone(), content.to_vec());
        self.add_path(path);
        Ok(())
    }

    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>> {
        self.virtual_files
            .read()
            .get(&*remote_path.to_string_lossy())
            .cloned()
            .ok_or_else(|| ConnectionError::TransferFailed("no such file".to_string()))
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out one [`MockConnection`] per host name.
#[derive(Default)]
pub struct MockConnectionFactory {
    connections: RwLock<HashMap<String, Arc<MockConnection>>>,
    unreachable: RwLock<HashSet<String>>,
    connects: AtomicU32,
}

impl MockConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mock behind `host`, created on first use.
    pub fn connection(&self, host: &str) -> Arc<MockConnection> {
        self.connections
            .write()
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(MockConnection::new(host)))
            .clone()
    }

    /// Refuse connections to `host`.
    pub fn set_unreachable(&self, host: &str) {
        self.unreachable.write().insert(host.to_string());
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn connect(&self, host: &Host) -> ConnectionResult<Arc<dyn Connection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.read().contains(&host.name) {
            return Err(ConnectionError::ConnectionFailed(format!(
                "{}: connection refused",
                host.name
            )));
        }
        Ok(self.connection(&host.name))
    }
}

/// An inventory with `hosts` in `group`.
pub fn inventory_with(group: &str, hosts: &[&str]) -> Inventory {
    let mut inventory = Inventory::new();
    for name in hosts {
        let mut host = Host::new(*name);
        host.add_to_group(group);
        inventory.add_host(host);
    }
    inventory
}

/// An executor over `inventory` whose connections come from `factory`.
pub fn executor(inventory: Inventory, factory: &Arc<MockConnectionFactory>) -> Executor {
    executor_with(ExecutorConfig::default(), inventory, factory)
}

pub fn executor_with(
    config: ExecutorConfig,
    inventory: Inventory,
    factory: &Arc<MockConnectionFactory>,
) -> Executor {
    let factory: Arc<dyn ConnectionFactory> = factory.clone();
    Executor::new(config, inventory, factory)
}
