//! Module system for Converge
//!
//! This module provides the core trait, types, and registry for modules.
//! A module reconciles one piece of desired state on a host: it inspects the
//! current state over the host's connection, acts only when the two differ,
//! and reports whether it changed anything.

pub mod archive;
pub mod authorized_key;
pub mod command;
pub mod copy;
pub mod debug;
pub mod file;
pub mod find;
pub mod package;
pub mod restore;
pub mod service;
pub mod set_fact;
pub mod shell;
pub mod unarchive;
pub mod user;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

use crate::backup::BackupError;
use crate::connection::{
    shell_quote, CommandResult, Connection, ConnectionError, ExecuteOptions, TransferOptions,
};
use crate::facts::Facts;
use crate::template::{TemplateEngine, Vars};

/// Errors that can occur during module execution
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("Module not found: {0}")]
    NotFound(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Command failed with exit code {code}: {message}")]
    RemoteExecution { code: i32, message: String },

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Connection(ConnectionError),
}

impl From<ConnectionError> for ModuleError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Timeout(secs) => ModuleError::Timeout(secs),
            other => ModuleError::Connection(other),
        }
    }
}

impl ModuleError {
    /// Whether the error means the host itself is gone
    pub fn is_transport(&self) -> bool {
        matches!(self, ModuleError::Connection(e) if e.is_transport())
    }
}

/// Result type for module operations
pub type ModuleResult<T> = Result<T, ModuleError>;

/// Status of a module execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    /// Module executed successfully and made changes
    Changed,
    /// Module executed successfully but no changes were needed
    Ok,
    /// Module ran but reported failure (e.g. nonzero exit of a command)
    Failed,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleStatus::Changed => write!(f, "changed"),
            ModuleStatus::Ok => write!(f, "ok"),
            ModuleStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Result of a module execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleOutput {
    /// Whether the module changed anything
    pub changed: bool,
    /// Human-readable message about what happened
    pub msg: String,
    /// Status of the execution
    pub status: ModuleStatus,
    /// Additional data returned by the module
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub data: IndexMap<String, JsonValue>,
    /// Variables to write into the host's play-local scope
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub set_vars: IndexMap<String, JsonValue>,
    /// Standard output (for command modules)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Standard error (for command modules)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Return code (for command modules)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rc: Option<i32>,
}

impl ModuleOutput {
    fn with_status(status: ModuleStatus, msg: impl Into<String>) -> Self {
        Self {
            changed: status == ModuleStatus::Changed,
            msg: msg.into(),
            status,
            data: IndexMap::new(),
            set_vars: IndexMap::new(),
            stdout: None,
            stderr: None,
            rc: None,
        }
    }

    /// Create a new successful output with no changes
    pub fn ok(msg: impl Into<String>) -> Self {
        Self::with_status(ModuleStatus::Ok, msg)
    }

    /// Create a new successful output with changes
    pub fn changed(msg: impl Into<String>) -> Self {
        Self::with_status(ModuleStatus::Changed, msg)
    }

    /// Create a failed output
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::with_status(ModuleStatus::Failed, msg)
    }

    /// Add data to the output
    pub fn with_data(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Add stdout/stderr/rc for command outputs
    pub fn with_command_output(mut self, result: &CommandResult) -> Self {
        self.stdout = Some(result.stdout.clone());
        self.stderr = Some(result.stderr.clone());
        self.rc = Some(result.exit_code);
        self
    }

    /// The output as a flat JSON mapping: `msg`, command fields when present
    /// (with `stdout_lines`), then module data.
    pub fn to_json(&self) -> serde_json::Map<String, JsonValue> {
        let mut map = serde_json::Map::new();
        map.insert("msg".to_string(), json!(self.msg));
        if let Some(rc) = self.rc {
            map.insert("rc".to_string(), json!(rc));
        }
        if let Some(stdout) = &self.stdout {
            map.insert("stdout".to_string(), json!(stdout));
            map.insert(
                "stdout_lines".to_string(),
                json!(stdout.lines().collect::<Vec<_>>()),
            );
        }
        if let Some(stderr) = &self.stderr {
            map.insert("stderr".to_string(), json!(stderr));
        }
        for (key, value) in &self.data {
            map.insert(key.clone(), value.clone());
        }
        map
    }
}

/// Parameters passed to a module
pub type ModuleParams = IndexMap<String, JsonValue>;

/// Context for module execution on one host
#[derive(Clone)]
pub struct ModuleContext {
    /// Inventory name of the target host
    pub host: String,
    /// Connection to the host
    pub connection: Arc<dyn Connection>,
    /// Facts gathered for the host
    pub facts: Arc<Facts>,
    /// Escalation and timeout applied to every command
    pub options: ExecuteOptions,
    /// Directory relative local paths resolve against
    pub base_dir: PathBuf,
    /// Variables in scope for the task
    pub vars: Arc<Vars>,
    /// Engine used to evaluate expressions given as parameters
    pub engine: Arc<TemplateEngine>,
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("host", &self.host)
            .field("connection", &self.connection.identifier())
            .field("options", &self.options)
            .field("base_dir", &self.base_dir)
            .finish()
    }
}

impl ModuleContext {
    pub fn new(host: impl Into<String>, connection: Arc<dyn Connection>) -> Self {
        Self {
            host: host.into(),
            connection,
            facts: Arc::new(Facts::new()),
            options: ExecuteOptions::new(),
            base_dir: PathBuf::from("."),
            vars: Arc::new(Vars::new()),
            engine: Arc::new(TemplateEngine::new()),
        }
    }

    pub fn with_facts(mut self, facts: Arc<Facts>) -> Self {
        self.facts = facts;
        self
    }

    pub fn with_options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn with_vars(mut self, vars: Arc<Vars>) -> Self {
        self.vars = vars;
        self
    }

    pub fn with_engine(mut self, engine: Arc<TemplateEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// Run a command with the context's options; the exit code is the
    /// caller's to interpret.
    pub async fn run(&self, command: &str) -> ModuleResult<CommandResult> {
        self.run_with(command, self.options.clone()).await
    }

    /// Run a command with explicit options
    pub async fn run_with(
        &self,
        command: &str,
        options: ExecuteOptions,
    ) -> ModuleResult<CommandResult> {
        trace!(host = %self.host, command = %command, "dispatch");
        Ok(self.connection.execute(command, Some(options)).await?)
    }

    /// Run a command that must succeed.
    pub async fn run_checked(&self, command: &str) -> ModuleResult<CommandResult> {
        let result = self.run(command).await?;
        if result.success {
            return Ok(result);
        }
        let message = if result.stderr.trim().is_empty() {
            result.stdout.trim().to_string()
        } else {
            result.stderr.trim().to_string()
        };
        if message.contains("Permission denied") || message.contains("Operation not permitted") {
            return Err(ModuleError::PermissionDenied(message));
        }
        Err(ModuleError::RemoteExecution {
            code: result.exit_code,
            message,
        })
    }

    /// Run a query command and report whether it exited zero
    pub async fn probe(&self, command: &str) -> ModuleResult<bool> {
        Ok(self.run(command).await?.success)
    }

    /// Whether a path exists on the host
    pub async fn path_exists(&self, path: &str) -> ModuleResult<bool> {
        self.probe(&format!("test -e {}", shell_quote(path))).await
    }

    /// Inspect a remote path without following symlinks
    pub async fn stat(&self, path: &str) -> ModuleResult<Option<RemoteStat>> {
        let quoted = shell_quote(path);
        let result = self
            .run(&format!(
                "stat -c '%a|%U|%G|%F|%s' {q} 2>/dev/null || stat -f '%Lp|%Su|%Sg|%HT|%z' {q} 2>/dev/null",
                q = quoted
            ))
            .await?;
        if !result.success {
            return Ok(None);
        }
        Ok(RemoteStat::parse(result.stdout.trim()))
    }

    /// Replace `dest` with `content` by writing a staging file first and
    /// moving it into place. The staging file is removed if anything fails
    /// before the move completes.
    ///
    /// A file being replaced keeps its mode, and under escalation its owner
    /// and group. New files get [`DEFAULT_FILE_MODE`]. Escalated contexts
    /// stage in `/tmp`, since the login user may not be able to write next
    /// to `dest`.
    pub async fn write_atomic(&self, dest: &str, content: &[u8]) -> ModuleResult<()> {
        let existing = self
            .stat(dest)
            .await?
            .filter(|stat| stat.kind == FileKind::File);

        let token = uuid::Uuid::new_v4().simple().to_string();
        let staging = if self.options.escalate {
            format!("/tmp/.converge-{}", token)
        } else {
            format!("{}.converge-tmp-{}", dest, token)
        };

        self.connection
            .upload_content(
                content,
                Path::new(&staging),
                Some(TransferOptions::new().with_mode(0o600)),
            )
            .await?;

        let staging_q = shell_quote(&staging);
        let placed = async {
            let mode = existing.as_ref().map_or(DEFAULT_FILE_MODE, |stat| stat.mode);
            self.run_checked(&format!("chmod {:o} {}", mode, staging_q))
                .await?;
            if self.options.escalate {
                let owner = match &existing {
                    Some(stat) => format!("{}:{}", stat.owner, stat.group),
                    None => self
                        .options
                        .escalate_user
                        .clone()
                        .unwrap_or_else(|| "root".to_string()),
                };
                self.run_checked(&format!("chown {} {}", shell_quote(&owner), staging_q))
                    .await?;
            }
            self.run_checked(&format!("mv -f {} {}", staging_q, shell_quote(dest)))
                .await
        }
        .await;

        if placed.is_err() {
            debug!(host = %self.host, staging = %staging, "removing staging file");
            let _ = self.run(&format!("rm -f {}", staging_q)).await;
        }
        placed.map(|_| ())
    }
}

/// Mode given to files created by [`ModuleContext::write_atomic`]
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Kind of a filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Link,
    Other,
}

/// Metadata of a remote path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStat {
    pub mode: u32,
    pub owner: String,
    pub group: String,
    pub kind: FileKind,
    pub size: u64,
}

impl RemoteStat {
    /// Parse `mode|owner|group|type|size`, as printed by GNU or BSD stat.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split('|');
        let mode = u32::from_str_radix(parts.next()?.trim(), 8).ok()?;
        let owner = parts.next()?.to_string();
        let group = parts.next()?.to_string();
        let kind_text = parts.next()?.to_ascii_lowercase();
        let size = parts.next().and_then(|s| s.trim().parse().ok()).unwrap_or(0);
        let kind = if kind_text.contains("directory") {
            FileKind::Directory
        } else if kind_text.contains("symbolic link") {
            FileKind::Link
        } else if kind_text.contains("regular") {
            FileKind::File
        } else {
            FileKind::Other
        };
        Some(Self {
            mode,
            owner,
            group,
            kind,
            size,
        })
    }
}

/// Trait that all modules must implement
#[async_trait]
pub trait Module: Send + Sync {
    /// Returns the name of the module
    fn name(&self) -> &'static str;

    /// Returns a description of what the module does
    fn description(&self) -> &'static str;

    /// Returns the list of required parameters
    fn required_params(&self) -> &[&'static str] {
        &[]
    }

    /// Validate the parameters before execution
    fn validate_params(&self, params: &ModuleParams) -> ModuleResult<()> {
        let _ = params;
        Ok(())
    }

    /// Execute the module with the given parameters
    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput>;
}

/// Helper trait for extracting parameters
pub trait ParamExt {
    fn get_string(&self, key: &str) -> ModuleResult<Option<String>>;
    fn get_string_required(&self, key: &str) -> ModuleResult<String>;
    fn get_bool(&self, key: &str) -> ModuleResult<Option<bool>>;
    fn get_bool_or(&self, key: &str, default: bool) -> ModuleResult<bool>;
    fn get_vec_string(&self, key: &str) -> ModuleResult<Option<Vec<String>>>;
    fn get_mode(&self, key: &str) -> ModuleResult<Option<u32>>;
}

impl ParamExt for ModuleParams {
    fn get_string(&self, key: &str) -> ModuleResult<Option<String>> {
        match self.get(key) {
            Some(JsonValue::String(s)) => Ok(Some(s.clone())),
            Some(JsonValue::Null) | None => Ok(None),
            Some(v @ (JsonValue::Number(_) | JsonValue::Bool(_))) => Ok(Some(v.to_string())),
            Some(_) => Err(ModuleError::InvalidParameter(format!(
                "{} must be a string",
                key
            ))),
        }
    }

    fn get_string_required(&self, key: &str) -> ModuleResult<String> {
        self.get_string(key)?
            .ok_or_else(|| ModuleError::MissingParameter(key.to_string()))
    }

    fn get_bool(&self, key: &str) -> ModuleResult<Option<bool>> {
        match self.get(key) {
            Some(JsonValue::Bool(b)) => Ok(Some(*b)),
            Some(JsonValue::String(s)) => match s.to_lowercase().as_str() {
                "true" | "yes" | "1" | "on" => Ok(Some(true)),
                "false" | "no" | "0" | "off" => Ok(Some(false)),
                _ => Err(ModuleError::InvalidParameter(format!(
                    "{} must be a boolean",
                    key
                ))),
            },
            Some(JsonValue::Null) | None => Ok(None),
            Some(_) => Err(ModuleError::InvalidParameter(format!(
                "{} must be a boolean",
                key
            ))),
        }
    }

    fn get_bool_or(&self, key: &str, default: bool) -> ModuleResult<bool> {
        Ok(self.get_bool(key)?.unwrap_or(default))
    }

    fn get_vec_string(&self, key: &str) -> ModuleResult<Option<Vec<String>>> {
        match self.get(key) {
            Some(JsonValue::Array(arr)) => Ok(Some(
                arr.iter()
                    .map(|item| match item {
                        JsonValue::String(s) => s.clone(),
                        v => v.to_string(),
                    })
                    .collect(),
            )),
            Some(JsonValue::String(s)) => Ok(Some(
                s.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            )),
            Some(JsonValue::Null) | None => Ok(None),
            Some(_) => Err(ModuleError::InvalidParameter(format!(
                "{} must be a list",
                key
            ))),
        }
    }

    /// File modes are octal whether written as `"0644"` or `644`.
    fn get_mode(&self, key: &str) -> ModuleResult<Option<u32>> {
        let text = match self.get(key) {
            Some(JsonValue::String(s)) => s.clone(),
            Some(JsonValue::Number(n)) => n.to_string(),
            Some(JsonValue::Null) | None => return Ok(None),
            Some(_) => {
                return Err(ModuleError::InvalidParameter(format!(
                    "{} must be an octal mode",
                    key
                )))
            }
        };
        let digits = text.trim().trim_start_matches("0o");
        u32::from_str_radix(digits, 8)
            .ok()
            .filter(|m| *m <= 0o7777)
            .map(Some)
            .ok_or_else(|| {
                ModuleError::InvalidParameter(format!("{} must be an octal mode, got {}", key, text))
            })
    }
}

/// Registry for looking up modules by name
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn Module>>,
}

impl ModuleRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }

    /// Create a registry with all built-in modules
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        // System state
        registry.register(Arc::new(package::PackageModule));
        registry.register(Arc::new(service::ServiceModule));
        registry.register(Arc::new(user::UserModule));
        registry.register(Arc::new(authorized_key::AuthorizedKeyModule));

        // Files
        registry.register(Arc::new(file::FileModule));
        registry.register(Arc::new(copy::CopyModule));
        registry.register(Arc::new(find::FindModule));
        registry.register(Arc::new(archive::ArchiveModule));
        registry.register(Arc::new(unarchive::UnarchiveModule));
        registry.register(Arc::new(restore::RestoreModule));

        // Commands
        registry.register(Arc::new(command::CommandModule));
        registry.register(Arc::new(shell::ShellModule));

        // Play logic
        registry.register(Arc::new(debug::DebugModule));
        registry.register(Arc::new(set_fact::SetFactModule));
        registry
    }

    /// Register a module
    pub fn register(&mut self, module: Arc<dyn Module>) {
        self.modules.insert(module.name().to_string(), module);
    }

    /// Get a module by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules.get(name).cloned()
    }

    /// Check if a module exists
    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Get all module names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Validate parameters and execute a module by name
    pub async fn invoke(
        &self,
        name: &str,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let module = self
            .get(name)
            .ok_or_else(|| ModuleError::NotFound(name.to_string()))?;

        for param in module.required_params() {
            if !params.contains_key(*param) {
                return Err(ModuleError::MissingParameter((*param).to_string()));
            }
        }
        module.validate_params(params)?;

        module.execute(params, context).await
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A scripted connection for module unit tests.

    use super::*;
    use crate::connection::ConnectionResult;
    use parking_lot::Mutex;

    /// Answers commands by the first rule whose needle occurs in the
    /// command; unmatched commands succeed with empty output.
    #[derive(Default)]
    pub struct ScriptedConnection {
        rules: Mutex<Vec<(String, CommandResult)>>,
        pub commands: Mutex<Vec<String>>,
        pub files: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl ScriptedConnection {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn on(&self, needle: &str, result: CommandResult) {
            self.rules.lock().push((needle.to_string(), result));
        }

        pub fn ok(&self, needle: &str, stdout: &str) {
            self.on(needle, CommandResult::success(stdout.to_string(), String::new()));
        }

        pub fn fail(&self, needle: &str, code: i32) {
            self.on(needle, CommandResult::failure(code, String::new(), String::new()));
        }

        pub fn ran(&self, needle: &str) -> bool {
            self.commands.lock().iter().any(|c| c.contains(needle))
        }
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        fn identifier(&self) -> &str {
            "scripted"
        }

        async fn is_alive(&self) -> bool {
            true
        }

        async fn execute(
            &self,
            command: &str,
            _options: Option<ExecuteOptions>,
        ) -> ConnectionResult<CommandResult> {
            self.commands.lock().push(command.to_string());
            let rules = self.rules.lock();
            Ok(rules
                .iter()
                .find(|(needle, _)| command.contains(needle.as_str()))
                .map(|(_, result)| result.clone())
                .unwrap_or_else(|| CommandResult::success(String::new(), String::new())))
        }

        async fn upload_content(
            &self,
            content: &[u8],
            remote_path: &Path,
            _options: Option<TransferOptions>,
        ) -> ConnectionResult<()> {
            self.files
                .lock()
                .insert(remote_path.to_string_lossy().into_owned(), content.to_vec());
            Ok(())
        }

        async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>> {
            self.files
                .lock()
                .get(&*remote_path.to_string_lossy())
                .cloned()
                .ok_or_else(|| ConnectionError::TransferFailed("no such file".to_string()))
        }

        async fn close(&self) -> ConnectionResult<()> {
            Ok(())
        }
    }

    pub fn context(conn: &Arc<ScriptedConnection>) -> ModuleContext {
        ModuleContext::new("test-host", conn.clone())
    }

    pub fn params(value: JsonValue) -> ModuleParams {
        match value {
            JsonValue::Object(map) => map.into_iter().collect(),
            _ => ModuleParams::new(),
        }
    }
}
