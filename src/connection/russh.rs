//! SSH transport built on russh.
//!
//! One SSH session per host; every command opens its own channel and file
//! transfer goes through an SFTP subsystem channel.

use async_trait::async_trait;
use russh::client::{Handle, Handler};
use russh::keys::key::PublicKey;
use russh::keys::load_secret_key;
use russh::ChannelMsg;
use russh_keys::agent::client::AgentClient;
use russh_sftp::client::SftpSession;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use super::{
    escalate_command, shell_quote, CommandResult, Connection, ConnectionError, ConnectionResult,
    ExecuteOptions, RusshError, TransferOptions,
};
use crate::config::SshConfig;
use crate::inventory::Host;

struct ClientHandler {
    host: String,
    port: u16,
    accept_unknown: bool,
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = RusshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => {
                debug!(host = %self.host, "Host key verified against known_hosts");
                Ok(true)
            }
            Ok(false) if self.accept_unknown => {
                warn!(host = %self.host, "Host not found in known_hosts, accepting");
                Ok(true)
            }
            Ok(false) => {
                warn!(host = %self.host, "Host not found in known_hosts, rejecting");
                Ok(false)
            }
            Err(e) => {
                warn!(host = %self.host, error = %e, "Host key verification failed");
                Ok(false)
            }
        }
    }
}

/// SSH connection to a single inventory host.
pub struct RusshConnection {
    identifier: String,
    handle: Arc<RwLock<Option<Handle<ClientHandler>>>>,
    connected: Arc<AtomicBool>,
}

impl RusshConnection {
    /// Connect and authenticate to `host`.
    pub async fn connect(host: &Host, ssh: &SshConfig) -> ConnectionResult<Self> {
        let address = host.address();
        let port = host.connection.port.unwrap_or(ssh.port);
        let user = host
            .connection
            .remote_user
            .clone()
            .or_else(|| ssh.user.clone())
            .unwrap_or_else(whoami);
        let timeout = Duration::from_secs(ssh.connect_timeout);

        debug!(host = %address, port = %port, user = %user, "Connecting via SSH (russh)");

        let mut config = russh::client::Config::default();
        config.inactivity_timeout = Some(Duration::from_secs(ssh.inactivity_timeout));
        let config = Arc::new(config);

        let addr = format!("{}:{}", address, port);
        let socket = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr))
            .await
            .map_err(|_| ConnectionError::ConnectionFailed(format!("timed out connecting to {}", addr)))?
            .map_err(|e| {
                ConnectionError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e))
            })?;
        socket.set_nodelay(true).map_err(|e| {
            ConnectionError::ConnectionFailed(format!("Failed to set TCP_NODELAY: {}", e))
        })?;

        let handler = ClientHandler {
            host: address.to_string(),
            port,
            accept_unknown: ssh.accept_unknown_hosts,
        };
        let mut session = russh::client::connect_stream(config, socket, handler)
            .await
            .map_err(|e| {
                ConnectionError::ConnectionFailed(format!("SSH handshake failed: {}", e))
            })?;

        Self::authenticate(&mut session, &user, ssh).await?;

        Ok(Self {
            identifier: format!("{}@{}:{}", user, address, port),
            handle: Arc::new(RwLock::new(Some(session))),
            connected: Arc::new(AtomicBool::new(true)),
        })
    }

    async fn authenticate(
        session: &mut Handle<ClientHandler>,
        user: &str,
        ssh: &SshConfig,
    ) -> ConnectionResult<()> {
        if ssh.use_agent && Self::try_agent_auth(session, user).await.is_ok() {
            debug!("Authenticated using SSH agent");
            return Ok(());
        }

        let configured = ssh.identity_files.iter().map(|p| expand_home(p));
        for key_path in configured.chain(default_identity_files()) {
            if Self::try_key_auth(session, user, &key_path).await.is_ok() {
                debug!(key = %key_path.display(), "Authenticated using key");
                return Ok(());
            }
        }

        if let Some(password) = &ssh.password {
            let authenticated = session
                .authenticate_password(user, password)
                .await
                .map_err(|e| {
                    ConnectionError::AuthenticationFailed(format!(
                        "Password authentication failed: {}",
                        e
                    ))
                })?;
            if authenticated {
                debug!("Authenticated using password");
                return Ok(());
            }
        }

        Err(ConnectionError::AuthenticationFailed(
            "All authentication methods failed".to_string(),
        ))
    }

    async fn try_agent_auth(
        session: &mut Handle<ClientHandler>,
        user: &str,
    ) -> ConnectionResult<()> {
        let mut agent = AgentClient::connect_env().await.map_err(|e| {
            ConnectionError::AuthenticationFailed(format!("Failed to connect to SSH agent: {}", e))
        })?;
        let identities = agent.request_identities().await.map_err(|e| {
            ConnectionError::AuthenticationFailed(format!("Failed to get agent identities: {}", e))
        })?;

        for identity in identities {
            let (returned_agent, result) = session
                .authenticate_future(user, identity.clone(), agent)
                .await;
            agent = returned_agent;
            match result {
                Ok(true) => return Ok(()),
                Ok(false) => trace!("Identity rejected, trying next"),
                Err(e) => trace!(error = %e, "Agent authentication attempt failed"),
            }
        }

        Err(ConnectionError::AuthenticationFailed(
            "All SSH agent identities rejected".to_string(),
        ))
    }

    async fn try_key_auth(
        session: &mut Handle<ClientHandler>,
        user: &str,
        key_path: &Path,
    ) -> ConnectionResult<()> {
        if !key_path.exists() {
            return Err(ConnectionError::AuthenticationFailed(format!(
                "Key file not found: {}",
                key_path.display()
            )));
        }
        let key_pair = load_secret_key(key_path, None).map_err(|e| {
            ConnectionError::AuthenticationFailed(format!(
                "Failed to load key {}: {}",
                key_path.display(),
                e
            ))
        })?;

        let authenticated = session
            .authenticate_publickey(user, Arc::new(key_pair))
            .await
            .map_err(|e| {
                ConnectionError::AuthenticationFailed(format!(
                    "Key authentication failed for {}: {}",
                    key_path.display(),
                    e
                ))
            })?;

        if authenticated {
            Ok(())
        } else {
            Err(ConnectionError::AuthenticationFailed(
                "Key authentication failed".to_string(),
            ))
        }
    }

    fn build_command(command: &str, options: &ExecuteOptions) -> String {
        let mut parts = Vec::new();
        for (key, value) in &options.env {
            parts.push(format!("export {}={}; ", key, shell_quote(value)));
        }
        if let Some(cwd) = &options.cwd {
            parts.push(format!("cd {} && ", shell_quote(cwd)));
        }
        parts.push(escalate_command(command, options));
        parts.concat()
    }

    async fn open_sftp(&self) -> ConnectionResult<SftpSession> {
        let guard = self.handle.read().await;
        let handle = guard.as_ref().ok_or(ConnectionError::ConnectionClosed)?;

        let channel = handle.channel_open_session().await.map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            ConnectionError::SshError(format!("Failed to open channel: {}", e))
        })?;
        drop(guard);

        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to request SFTP subsystem: {}", e))
        })?;

        SftpSession::new(channel.into_stream()).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to create SFTP session: {}", e))
        })
    }

    async fn run(&self, full_command: String) -> ConnectionResult<CommandResult> {
        let guard = self.handle.read().await;
        let handle = guard.as_ref().ok_or(ConnectionError::ConnectionClosed)?;

        // A channel that cannot be opened means the session is gone.
        let mut channel = handle.channel_open_session().await.map_err(|e| {
            self.connected.store(false, Ordering::SeqCst);
            ConnectionError::SshError(format!("Failed to open channel: {}", e))
        })?;
        drop(guard);

        channel.exec(true, full_command).await.map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to execute command: {}", e))
        })?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        let stdout = String::from_utf8_lossy(&stdout).to_string();
        let stderr = String::from_utf8_lossy(&stderr).to_string();
        match exit_code {
            Some(0) => Ok(CommandResult::success(stdout, stderr)),
            Some(code) => Ok(CommandResult::failure(code as i32, stdout, stderr)),
            None => {
                self.connected.store(false, Ordering::SeqCst);
                Err(ConnectionError::ConnectionClosed)
            }
        }
    }
}

#[async_trait]
impl Connection for RusshConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn is_alive(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.handle.read().await.is_some()
    }

    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        let options = options.unwrap_or_default();
        let full_command = Self::build_command(command, &options);
        trace!(command = %full_command, "Executing remote command");

        match options.timeout {
            Some(secs) => {
                tokio::time::timeout(Duration::from_secs(secs), self.run(full_command))
                    .await
                    .map_err(|_| ConnectionError::Timeout(secs))?
            }
            None => self.run(full_command).await,
        }
    }

    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        let options = options.unwrap_or_default();
        debug!(remote = %remote_path.display(), size = %content.len(), "Uploading content via SFTP");

        let sftp = self.open_sftp().await?;

        if options.create_dirs {
            if let Some(parent) = remote_path.parent() {
                let mut current = PathBuf::new();
                for component in parent.components() {
                    current.push(component);
                    if current.as_os_str() == "/" {
                        continue;
                    }
                    // Existing directories make this fail; that is fine.
                    let _ = sftp.create_dir(current.to_string_lossy().to_string()).await;
                }
            }
        }

        let path = remote_path.to_string_lossy().to_string();
        let mut file = sftp.create(&path).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to create {}: {}", path, e))
        })?;
        file.write_all(content).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to write {}: {}", path, e))
        })?;
        file.shutdown().await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to close {}: {}", path, e))
        })?;
        drop(file);

        if let Some(mode) = options.mode {
            let attrs = russh_sftp::protocol::FileAttributes {
                permissions: Some(mode),
                ..Default::default()
            };
            sftp.set_metadata(&path, attrs).await.map_err(|e| {
                ConnectionError::TransferFailed(format!("Failed to set permissions: {}", e))
            })?;
        }

        Ok(())
    }

    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>> {
        debug!(remote = %remote_path.display(), "Downloading content via SFTP");

        let sftp = self.open_sftp().await?;
        let path = remote_path.to_string_lossy().to_string();
        let mut file = sftp.open(&path).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to open {}: {}", path, e))
        })?;

        let mut content = Vec::new();
        file.read_to_end(&mut content).await.map_err(|e| {
            ConnectionError::TransferFailed(format!("Failed to read {}: {}", path, e))
        })?;
        Ok(content)
    }

    async fn close(&self) -> ConnectionResult<()> {
        debug!(identifier = %self.identifier, "Closing SSH connection");
        self.connected.store(false, Ordering::SeqCst);

        let handle = self.handle.write().await.take();
        if let Some(handle) = handle {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "run finished", "en")
                .await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RusshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RusshConnection")
            .field("identifier", &self.identifier)
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "root".to_string())
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|h| h.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

fn default_identity_files() -> Vec<PathBuf> {
    let Some(home) = dirs::home_dir() else {
        return Vec::new();
    };
    let ssh_dir = home.join(".ssh");
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .filter(|p| p.exists())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_command_with_env_and_cwd() {
        let opts = ExecuteOptions::new()
            .with_cwd("/srv/app")
            .with_env("LANG", "C");
        assert_eq!(
            RusshConnection::build_command("ls", &opts),
            "export LANG='C'; cd '/srv/app' && ls"
        );
    }

    #[test]
    fn test_build_command_escalated() {
        let opts = ExecuteOptions::new().with_escalation(None);
        assert_eq!(
            RusshConnection::build_command("id -u", &opts),
            "sudo -n -u root -- sh -c 'id -u'"
        );
    }

    #[test]
    fn test_expand_home_leaves_absolute_paths() {
        assert_eq!(expand_home("/etc/key"), PathBuf::from("/etc/key"));
    }
}
