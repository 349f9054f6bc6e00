//! Connection layer for remote host communication.
//!
//! A [`Connection`] is the shell channel modules run commands through. The
//! runner opens one per host per task through a [`Connector`], hands it to
//! the module exclusively, and closes it once the result is captured.
//!
//! # Supported Transports
//!
//! - **SSH** (via `russh`, default feature): agent, key file, default keys,
//!   then password authentication
//! - **Local**: direct execution on the control node (`ansible_connection=local`)
//!
//! Privilege escalation is applied by rewriting the command with
//! [`wrap_become`] before it reaches the transport.

/// Local execution connection implementation.
pub mod local;

/// Pure Rust SSH implementation using russh.
#[cfg(feature = "russh")]
pub mod ssh;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub use crate::config::SshConfig;
pub use local::{LocalConnection, LocalConnector};
#[cfg(feature = "russh")]
pub use ssh::{SshConnection, SshConnector};

use crate::vars::{resolve, JsonValue, VarMap};

/// Russh-related error type - wraps russh::Error for the client Handler trait
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
        ConnectionError::SshError(err.to_string())
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

    /// Command execution failed (not to be confused with non-zero exit code).
    #[error("Command execution failed: {0}")]
    ExecutionFailed(String),

    /// File upload failed.
    #[error("File transfer failed: {0}")]
    TransferFailed(String),

    /// Connection or operation timed out.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// Configuration is invalid or incomplete.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The become method is not one of `sudo` or `su`.
    #[error("unsupported become method: {0}")]
    UnsupportedBecomeMethod(String),

    /// SSH-specific error from the underlying implementation.
    #[error("SSH error: {0}")]
    SshError(String),

    /// I/O error during connection operations.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Connection was closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl ConnectionError {
    /// Whether the error means the host could not be reached at all
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectionFailed(_)
                | ConnectionError::AuthenticationFailed(_)
                | ConnectionError::Timeout(_)
                | ConnectionError::SshError(_)
                | ConnectionError::ConnectionClosed
        )
    }
}

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// The result of executing a command on a connection.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    /// Exit code of the command (0 typically indicates success).
    pub exit_code: i32,
    /// Content written to standard output.
    pub stdout: String,
    /// Content written to standard error.
    pub stderr: String,
    /// Convenience flag: `true` if `exit_code == 0`.
    pub success: bool,
}

impl CommandResult {
    /// Create a new successful command result
    pub fn success(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: stderr.into(),
            success: true,
        }
    }

    /// Create a new failed command result
    pub fn failure(exit_code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
            success: exit_code == 0,
        }
    }
}

/// Privilege escalation settings applied to a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BecomeSettings {
    /// Whether to escalate at all
    pub enabled: bool,
    /// Target user
    pub user: String,
    /// `sudo` or `su`
    pub method: String,
}

impl Default for BecomeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            user: "root".to_string(),
            method: "sudo".to_string(),
        }
    }
}

impl BecomeSettings {
    /// Escalate to `user` with `sudo`
    pub fn sudo(user: impl Into<String>) -> Self {
        Self {
            enabled: true,
            user: user.into(),
            method: "sudo".to_string(),
        }
    }
}

/// Options for command execution
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Timeout in seconds (None for no timeout)
    pub timeout: Option<u64>,
    /// Privilege escalation for the command
    pub r#become: BecomeSettings,
}

impl ExecuteOptions {
    /// Create new execute options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set privilege escalation
    pub fn with_become(mut self, settings: BecomeSettings) -> Self {
        self.r#become = settings;
        self
    }
}

/// Quote a string for a POSIX shell using single quotes
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Rewrite `command` to run with privilege escalation.
///
/// Returns the command unchanged when escalation is disabled.
pub fn wrap_become(command: &str, settings: &BecomeSettings) -> ConnectionResult<String> {
    if !settings.enabled {
        return Ok(command.to_string());
    }

    let quoted = shell_quote(command);
    match settings.method.as_str() {
        "sudo" if settings.user.is_empty() || settings.user == "root" => {
            Ok(format!("sudo -n sh -c {}", quoted))
        }
        "sudo" => Ok(format!("sudo -n -u {} sh -c {}", settings.user, quoted)),
        "su" => Ok(format!("su - {} -c {}", settings.user, quoted)),
        other => Err(ConnectionError::UnsupportedBecomeMethod(other.to_string())),
    }
}

/// A shell channel to one host
#[async_trait]
pub trait Connection: Send + Sync {
    /// Get the connection identifier (`user@host:port` or `local`)
    fn identifier(&self) -> &str;

    /// Execute a command, feeding `input` to its standard input
    async fn execute_with_input(
        &self,
        command: &str,
        input: Option<&[u8]>,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult>;

    /// Execute a command on the host
    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        self.execute_with_input(command, None, options).await
    }

    /// Write `content` to `remote_path` on the host
    async fn put_content(
        &self,
        content: &[u8],
        remote_path: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<()> {
        let command = format!("cat > {}", shell_quote(remote_path));
        let result = self
            .execute_with_input(&command, Some(content), options)
            .await?;
        if result.success {
            Ok(())
        } else {
            Err(ConnectionError::TransferFailed(format!(
                "writing {} failed: {}",
                remote_path,
                result.stderr.trim()
            )))
        }
    }

    /// Upload a local file to `remote_path` on the host
    async fn put_file(
        &self,
        local_path: &Path,
        remote_path: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<()> {
        let content = tokio::fs::read(local_path).await?;
        self.put_content(&content, remote_path, options).await
    }

    /// Close the connection
    async fn close(&self) -> ConnectionResult<()>;
}

/// Transport selected for a host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Ssh,
    Local,
}

/// Connection attributes of a host, read from its variables
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    /// Inventory name
    pub host: String,
    /// Address to connect to (`ansible_host`)
    pub address: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
    pub kind: ConnectionKind,
    /// Connect timeout in seconds
    pub connect_timeout: u64,
    /// Try the SSH agent before key files
    pub use_agent: bool,
}

impl ConnectionParams {
    /// Read connection attributes from a host's variables, falling back to
    /// the configured SSH defaults.
    pub fn from_vars(host: &str, vars: &VarMap, ssh: &SshConfig) -> Self {
        let string = |key: &str| -> Option<String> {
            vars.get(key)
                .filter(|v| !v.is_null())
                .map(resolve::to_string)
        };

        let port = match vars.get("ansible_port") {
            Some(JsonValue::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Some(JsonValue::String(s)) => s.parse().ok(),
            _ => None,
        }
        .unwrap_or(ssh.port);

        let kind = match string("ansible_connection").as_deref() {
            Some("local") => ConnectionKind::Local,
            _ => ConnectionKind::Ssh,
        };

        Self {
            host: host.to_string(),
            address: string("ansible_host").unwrap_or_else(|| host.to_string()),
            port,
            user: string("ansible_user").unwrap_or_else(|| ssh.user.clone()),
            password: string("ansible_password").or_else(|| string("ansible_ssh_pass")),
            private_key: string("ansible_ssh_private_key_file")
                .or_else(|| ssh.identity_file.clone())
                .map(|p| expand_path(&p)),
            kind,
            connect_timeout: ssh.connect_timeout,
            use_agent: ssh.use_agent,
        }
    }
}

/// Opens shell channels to hosts
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel to the host described by `params`
    async fn connect(&self, params: &ConnectionParams) -> ConnectionResult<Arc<dyn Connection>>;
}

/// Picks the local transport for `ansible_connection=local`, SSH otherwise
#[derive(Debug, Default, Clone)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, params: &ConnectionParams) -> ConnectionResult<Arc<dyn Connection>> {
        debug!(host = %params.host, kind = ?params.kind, "Opening connection");
        match params.kind {
            ConnectionKind::Local => LocalConnector.connect(params).await,
            #[cfg(feature = "russh")]
            ConnectionKind::Ssh => SshConnector.connect(params).await,
            #[cfg(not(feature = "russh"))]
            ConnectionKind::Ssh => Err(ConnectionError::InvalidConfig(
                "ssh transport is not compiled in (enable the `russh` feature)".to_string(),
            )),
        }
    }
}

/// Expand `~` and environment variables in a path
pub fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or_else(|_| path.into());
    PathBuf::from(expanded.as_ref())
}

/// Default identity files that exist under `~/.ssh`
pub fn default_identity_files() -> Vec<PathBuf> {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    let ssh_dir = home.join(".ssh");

    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .into_iter()
        .map(|name| ssh_dir.join(name))
        .filter(|p| p.exists())
        .collect()
}
