//! SSH connection module
//!
//! SSH connectivity using the pure Rust `russh` crate. One
//! [`SshConnection`] wraps one authenticated session; every command runs on
//! its own session channel.

use async_trait::async_trait;
use russh::client::{Handle, Handler};
use russh::keys::key::PublicKey;
use russh::keys::load_secret_key;
use russh::ChannelMsg;
use russh_keys::agent::client::AgentClient;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::{
    default_identity_files, wrap_become, CommandResult, Connection, ConnectionError,
    ConnectionParams, ConnectionResult, Connector, ExecuteOptions, RusshError,
};

/// Client handler for russh
struct ClientHandler {
    host: String,
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = RusshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept-new semantics: host keys are not pinned.
        debug!(
            host = %self.host,
            fingerprint = %server_public_key.fingerprint(),
            "Accepting server host key"
        );
        Ok(true)
    }
}

/// An authenticated SSH session to one host
pub struct SshConnection {
    identifier: String,
    handle: RwLock<Option<Handle<ClientHandler>>>,
}

impl std::fmt::Debug for SshConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnection")
            .field("identifier", &self.identifier)
            .finish()
    }
}

impl SshConnection {
    /// Connect and authenticate to the host described by `params`
    pub async fn connect(params: &ConnectionParams) -> ConnectionResult<Self> {
        let timeout = Duration::from_secs(params.connect_timeout.max(1));
        let identifier = format!("{}@{}:{}", params.user, params.address, params.port);
        debug!(
            host = %params.address,
            port = %params.port,
            user = %params.user,
            "Connecting via SSH"
        );

        let mut config = russh::client::Config::default();
        config.inactivity_timeout = Some(Duration::from_secs(3600));
        let config = Arc::new(config);

        let addr = format!("{}:{}", params.address, params.port);
        let socket = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr))
            .await
            .map_err(|_| ConnectionError::Timeout(timeout.as_secs()))?
            .map_err(|e| {
                ConnectionError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e))
            })?;
        socket.set_nodelay(true)?;

        let handler = ClientHandler {
            host: params.address.clone(),
        };
        let mut session = tokio::time::timeout(
            timeout,
            russh::client::connect_stream(config, socket, handler),
        )
        .await
        .map_err(|_| ConnectionError::Timeout(timeout.as_secs()))?
        .map_err(|e| ConnectionError::ConnectionFailed(format!("SSH handshake failed: {}", e)))?;

        Self::authenticate(&mut session, params).await?;
        debug!(identifier = %identifier, "SSH connection established");

        Ok(Self {
            identifier,
            handle: RwLock::new(Some(session)),
        })
    }

    /// Agent, then explicit key, then default keys, then password
    async fn authenticate(
        session: &mut Handle<ClientHandler>,
        params: &ConnectionParams,
    ) -> ConnectionResult<()> {
        let user = params.user.as_str();

        if params.use_agent && Self::try_agent_auth(session, user).await.is_ok() {
            debug!("Authenticated using SSH agent");
            return Ok(());
        }

        let keys = params
            .private_key
            .iter()
            .cloned()
            .chain(default_identity_files());
        for key_path in keys {
            match Self::try_key_auth(session, user, &key_path).await {
                Ok(()) => {
                    debug!(key = %key_path.display(), "Authenticated using key");
                    return Ok(());
                }
                Err(e) => trace!(key = %key_path.display(), error = %e, "Key rejected"),
            }
        }

        if let Some(password) = &params.password {
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

        Err(ConnectionError::AuthenticationFailed(format!(
            "all authentication methods failed for {}@{}",
            user, params.address
        )))
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

            if let Ok(true) = result {
                return Ok(());
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
            .map_err(|e| ConnectionError::AuthenticationFailed(e.to_string()))?;

        if authenticated {
            Ok(())
        } else {
            Err(ConnectionError::AuthenticationFailed(
                "Key authentication failed".to_string(),
            ))
        }
    }

    async fn run(&self, command: String, input: Option<&[u8]>) -> ConnectionResult<CommandResult> {
        let mut channel = {
            let guard = self.handle.read().await;
            let handle = guard.as_ref().ok_or(ConnectionError::ConnectionClosed)?;
            handle.channel_open_session().await.map_err(|e| {
                ConnectionError::ExecutionFailed(format!("Failed to open channel: {}", e))
            })?
        };

        channel.exec(true, command).await.map_err(|e| {
            ConnectionError::ExecutionFailed(format!("Failed to execute command: {}", e))
        })?;

        if let Some(mut data) = input {
            channel
                .data(&mut data)
                .await
                .map_err(|e| ConnectionError::TransferFailed(e.to_string()))?;
        }
        channel
            .eof()
            .await
            .map_err(|e| ConnectionError::ExecutionFailed(format!("Failed to send EOF: {}", e)))?;

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

        let exit_code = exit_code.map(|e| e as i32).unwrap_or(-1);
        trace!(exit_code = %exit_code, "Remote command completed");
        Ok(CommandResult::failure(
            exit_code,
            String::from_utf8_lossy(&stdout),
            String::from_utf8_lossy(&stderr),
        ))
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn execute_with_input(
        &self,
        command: &str,
        input: Option<&[u8]>,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        let options = options.unwrap_or_default();
        let command = wrap_become(command, &options.r#become)?;
        trace!(command = %command, "Executing remote command");

        match options.timeout {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), self.run(command, input))
                .await
                .map_err(|_| ConnectionError::Timeout(secs))?,
            None => self.run(command, input).await,
        }
    }

    async fn close(&self) -> ConnectionResult<()> {
        let handle = self.handle.write().await.take();
        if let Some(handle) = handle {
            debug!(identifier = %self.identifier, "Closing SSH connection");
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await;
        }
        Ok(())
    }
}

/// Opens [`SshConnection`]s
#[derive(Debug, Default, Clone)]
pub struct SshConnector;

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> ConnectionResult<Arc<dyn Connection>> {
        Ok(Arc::new(SshConnection::connect(params).await?))
    }
}
