//! Local connection module
//!
//! Runs commands and file operations on the control node itself, without
//! any network transport.

use async_trait::async_trait;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, trace};

use super::{
    escalate_command, CommandResult, Connection, ConnectionError, ConnectionResult,
    ExecuteOptions, TransferOptions,
};

/// Local connection for executing commands on the current host
#[derive(Debug, Clone)]
pub struct LocalConnection {
    identifier: String,
}

impl LocalConnection {
    /// Create a new local connection named after this machine
    pub fn new() -> Self {
        let identifier = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());

        Self { identifier }
    }

    /// Create a local connection with a custom identifier
    pub fn with_identifier(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
        }
    }

    fn build_command(&self, command: &str, options: &ExecuteOptions) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(escalate_command(command, options));

        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd
    }
}

impl Default for LocalConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        let options = options.unwrap_or_default();
        debug!(command = %command, escalate = options.escalate, "Executing local command");

        let child = self.build_command(command, &options).spawn().map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to spawn process: {}", e))
        })?;

        let output = if let Some(timeout_secs) = options.timeout {
            let timeout = tokio::time::Duration::from_secs(timeout_secs);
            match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(result) => result.map_err(|e| {
                    ConnectionError::ExecutionFailed(format!("Failed to wait for process: {}", e))
                })?,
                Err(_) => return Err(ConnectionError::Timeout(timeout_secs)),
            }
        } else {
            child.wait_with_output().await.map_err(|e| {
                ConnectionError::ExecutionFailed(format!("Failed to wait for process: {}", e))
            })?
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        trace!(exit_code = %exit_code, stdout_len = %stdout.len(), stderr_len = %stderr.len(), "Command completed");

        if output.status.success() {
            Ok(CommandResult::success(stdout, stderr))
        } else {
            Ok(CommandResult::failure(exit_code, stdout, stderr))
        }
    }

    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        let options = options.unwrap_or_default();
        debug!(dst = %remote_path.display(), size = %content.len(), "Writing content locally");

        if options.create_dirs {
            if let Some(parent) = remote_path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    ConnectionError::TransferFailed(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        tokio::fs::write(remote_path, content).await.map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to write {}: {}",
                remote_path.display(),
                e
            ))
        })?;

        if let Some(mode) = options.mode {
            let perms = std::fs::Permissions::from_mode(mode);
            tokio::fs::set_permissions(remote_path, perms)
                .await
                .map_err(|e| {
                    ConnectionError::TransferFailed(format!("Failed to set permissions: {}", e))
                })?;
        }

        Ok(())
    }

    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>> {
        tokio::fs::read(remote_path).await.map_err(|e| {
            ConnectionError::TransferFailed(format!(
                "Failed to read {}: {}",
                remote_path.display(),
                e
            ))
        })
    }

    async fn path_exists(&self, path: &Path) -> ConnectionResult<bool> {
        Ok(tokio::fs::symlink_metadata(path).await.is_ok())
    }

    async fn close(&self) -> ConnectionResult<()> {
        Ok(())
    }
}
