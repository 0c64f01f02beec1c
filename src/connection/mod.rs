//! Connection layer for remote host communication.
//!
//! Modules never talk to a transport directly. Everything they need from a
//! host goes through the [`Connection`] trait: run a command, put a file,
//! fetch a file, probe a path. The orchestrator obtains one connection per
//! host from a [`ConnectionFactory`] at the start of a play.
//!
//! # Supported Transports
//!
//! - **SSH** (via `russh`, default feature): key, agent and password
//!   authentication, SFTP for file transfer
//! - **Local**: direct execution on the control node
//!
//! # Example
//!
//! ```rust,ignore
//! use converge::connection::{Connection, ExecuteOptions, LocalConnection};
//!
//! let conn = LocalConnection::new();
//! let result = conn.execute("uname -s", None).await?;
//! println!("kernel: {}", result.stdout.trim());
//!
//! let opts = ExecuteOptions::new().with_escalation(Some("root".into()));
//! conn.execute("systemctl restart nginx", Some(opts)).await?;
//! ```

/// Local execution connection implementation.
pub mod local;

/// Pure Rust SSH implementation using russh.
#[cfg(feature = "russh")]
pub mod russh;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::config::SshConfig;
use crate::inventory::{Host, Transport};

pub use local::LocalConnection;
#[cfg(feature = "russh")]
pub use russh::RusshConnection;

/// Wrapper so russh errors can serve as the client handler's error type.
#[cfg(feature = "russh")]
#[derive(Debug)]
pub struct RusshError(pub ::russh::Error);

#[cfg(feature = "russh")]
impl From<::russh::Error> for RusshError {
    fn from(err: ::russh::Error) -> Self {
        RusshError(err)
    }
}

#[cfg(feature = "russh")]
impl std::fmt::Display for RusshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Russh error: {}", self.0)
    }
}

#[cfg(feature = "russh")]
impl std::error::Error for RusshError {}

#[cfg(feature = "russh")]
impl From<::russh::Error> for ConnectionError {
    fn from(err: ::russh::Error) -> Self {
        ConnectionError::SshError(format!("Russh error: {}", err))
    }
}

/// Errors that can occur during connection operations.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Failed to establish initial connection to the host.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication was rejected by the remote host.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Command could not be run at all (not to be confused with a non-zero exit).
    #[error("Command execution failed: {0}")]
    ExecutionFailed(String),

    /// File upload or download failed.
    #[error("File transfer failed: {0}")]
    TransferFailed(String),

    /// Operation timed out.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// The host address could not be resolved.
    #[error("Host not found: {0}")]
    HostNotFound(String),

    /// Configuration is invalid or incomplete.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// SSH protocol error from the underlying implementation.
    #[error("SSH error: {0}")]
    SshError(String),

    /// Local I/O error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// The connection was closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl ConnectionError {
    /// Whether this error means the host itself stopped answering.
    ///
    /// Transport failures mark a host unreachable; everything else is scoped
    /// to the single operation that hit it.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectionFailed(_)
                | ConnectionError::AuthenticationFailed(_)
                | ConnectionError::HostNotFound(_)
                | ConnectionError::SshError(_)
                | ConnectionError::ConnectionClosed
        )
    }
}

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// The result of executing a command on a connection.
///
/// ```rust
/// use converge::connection::CommandResult;
///
/// let result = CommandResult::success("Hello".into(), String::new());
/// assert!(result.success);
/// assert_eq!(result.exit_code, 0);
///
/// let failed = CommandResult::failure(1, String::new(), "error".into());
/// assert!(!failed.success);
/// ```
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit code of the command.
    pub exit_code: i32,
    /// Content written to standard output.
    pub stdout: String,
    /// Content written to standard error.
    pub stderr: String,
    /// `true` if `exit_code == 0`.
    pub success: bool,
}

impl CommandResult {
    /// Create a new successful command result
    pub fn success(stdout: String, stderr: String) -> Self {
        Self {
            exit_code: 0,
            stdout,
            stderr,
            success: true,
        }
    }

    /// Create a new failed command result
    pub fn failure(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            exit_code,
            stdout,
            stderr,
            success: false,
        }
    }

    /// Get the combined output (stdout + stderr)
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Options for command execution
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Working directory for the command
    pub cwd: Option<String>,
    /// Environment variables to set
    pub env: HashMap<String, String>,
    /// Timeout in seconds (None for no timeout)
    pub timeout: Option<u64>,
    /// Run command with privilege escalation
    pub escalate: bool,
    /// User to escalate to (default: root)
    pub escalate_user: Option<String>,
    /// Escalation method (sudo, su, doas)
    pub escalate_method: Option<String>,
}

impl ExecuteOptions {
    /// Create new execute options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the working directory
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable privilege escalation
    pub fn with_escalation(mut self, user: Option<String>) -> Self {
        self.escalate = true;
        self.escalate_user = user;
        self
    }

    /// Set the escalation method
    pub fn with_escalation_method(mut self, method: impl Into<String>) -> Self {
        self.escalate_method = Some(method.into());
        self
    }
}

/// Options for file transfer
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// File mode (permissions) to set
    pub mode: Option<u32>,
    /// Create parent directories if they don't exist
    pub create_dirs: bool,
}

impl TransferOptions {
    /// Create new transfer options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set file mode
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Enable directory creation
    pub fn with_create_dirs(mut self) -> Self {
        self.create_dirs = true;
        self
    }
}

/// The capability interface every transport implements.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Get the connection identifier
    fn identifier(&self) -> &str;

    /// Check if the connection is still alive
    async fn is_alive(&self) -> bool;

    /// Execute a command on the host
    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult>;

    /// Write content to a file on the host
    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()>;

    /// Read a file from the host
    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>>;

    /// Check if a path exists on the host
    async fn path_exists(&self, path: &Path) -> ConnectionResult<bool> {
        let cmd = format!("test -e {}", shell_quote(&path.to_string_lossy()));
        Ok(self.execute(&cmd, None).await?.success)
    }

    /// Probe whether privilege escalation works non-interactively.
    ///
    /// Returns `Ok(false)` when the host answered but refused elevation.
    async fn check_escalation(&self, options: &ExecuteOptions) -> ConnectionResult<bool> {
        let mut probe = options.clone();
        probe.escalate = true;
        Ok(self.execute("true", Some(probe)).await?.success)
    }

    /// Close the connection
    async fn close(&self) -> ConnectionResult<()>;
}

/// Quote a string for safe interpolation into a POSIX shell command.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Wrap a command for privilege escalation.
///
/// Escalation is always non-interactive: a host that would prompt for a
/// password is treated as refusing elevation.
pub fn escalate_command(command: &str, options: &ExecuteOptions) -> String {
    if !options.escalate {
        return command.to_string();
    }
    let user = options.escalate_user.as_deref().unwrap_or("root");
    let quoted = shell_quote(command);
    match options.escalate_method.as_deref().unwrap_or("sudo") {
        "su" => format!("su - {} -c {}", user, quoted),
        "doas" => format!("doas -n -u {} sh -c {}", user, quoted),
        _ => format!("sudo -n -u {} -- sh -c {}", user, quoted),
    }
}

/// Builds connections for inventory hosts.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a connection to `host`.
    async fn connect(&self, host: &Host) -> ConnectionResult<Arc<dyn Connection>>;
}

/// Picks the transport named by each host's connection parameters.
#[derive(Debug, Clone, Default)]
pub struct TransportFactory {
    ssh: SshConfig,
}

impl TransportFactory {
    /// Create a factory using the given SSH settings
    pub fn new(ssh: SshConfig) -> Self {
        Self { ssh }
    }
}

#[async_trait]
impl ConnectionFactory for TransportFactory {
    async fn connect(&self, host: &Host) -> ConnectionResult<Arc<dyn Connection>> {
        match host.connection.transport {
            Transport::Local => Ok(Arc::new(LocalConnection::with_identifier(&host.name))),
            #[cfg(feature = "russh")]
            Transport::Ssh => {
                let conn = RusshConnection::connect(host, &self.ssh).await?;
                Ok(Arc::new(conn))
            }
            #[cfg(not(feature = "russh"))]
            Transport::Ssh => Err(ConnectionError::InvalidConfig(format!(
                "host '{}' needs ssh but the russh feature is disabled",
                host.name
            ))),
        }
    }
}
