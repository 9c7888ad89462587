//! SSH Client implementation using russh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{HashAlg, PublicKey};
use russh::{Channel, ChannelMsg};
use tracing::{debug, info, warn};

use super::auth::{resolve_auth_methods, AuthMechanism};
use super::config::{CredentialConfig, PtyConfig};
use super::shell::{spawn_shell_owner_task, ShellConnector, ShellError, ShellEvent, ShellIo};
use crate::error::{AppError, ErrorCode};

/// Client handler for russh callbacks
///
/// Host identity is accepted without pinning: the bridge has no
/// known_hosts store and the peer supplies the target host. The
/// fingerprint is logged so operators can audit what was trusted.
pub struct ClientHandler {
    host: String,
    port: u16,
}

impl ClientHandler {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }
}

impl client::Handler for ClientHandler {
    type Error = ShellError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            "Accepting host key for {}:{} without verification (fingerprint: {})",
            self.host,
            self.port,
            server_public_key.fingerprint(HashAlg::Sha256)
        );
        Ok(true)
    }
}

/// Production [`ShellConnector`]: dials the host and starts a PTY shell
pub struct SshConnector {
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn connect(&self, config: &CredentialConfig) -> Result<Handle<ClientHandler>, AppError> {
        let addr = config.address();
        info!("Connecting to SSH server at {}", addr);

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };
        let handler = ClientHandler::new(config.host.clone(), config.port);

        let mut handle = tokio::time::timeout(
            self.connect_timeout,
            client::connect(
                Arc::new(ssh_config),
                (config.host.as_str(), config.port),
                handler,
            ),
        )
        .await
        .map_err(|_| {
            connection_failed(ShellError::Timeout(format!(
                "no handshake with {} after {:?}",
                addr, self.connect_timeout
            )))
        })?
        .map_err(connection_failed)?;

        debug!("SSH handshake completed with {}", addr);

        if let Err(e) = authenticate(&mut handle, config).await {
            disconnect(&handle).await;
            return Err(connection_failed(e));
        }

        info!("SSH authentication successful for {}@{}", config.user, addr);
        Ok(handle)
    }
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn open_shell(
        &self,
        config: &CredentialConfig,
        pty: &PtyConfig,
    ) -> Result<ShellIo, AppError> {
        let handle = self.connect(config).await?;

        let mut channel = match handle.channel_open_session().await {
            Ok(channel) => channel,
            Err(e) => {
                disconnect(&handle).await;
                return Err(AppError::with_cause(
                    ErrorCode::SshSessionCreationFailed,
                    "Failed to create SSH session",
                    ShellError::from(e),
                ));
            }
        };

        let mut pending = Vec::new();

        debug!("Channel opened, requesting PTY {}x{}", pty.cols, pty.rows);
        let pty_result = match channel
            .request_pty(true, &pty.term, pty.cols, pty.rows, 0, 0, &pty.modes())
            .await
        {
            Ok(()) => await_reply(&mut channel, "pty-req", &mut pending).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = pty_result {
            disconnect(&handle).await;
            return Err(AppError::with_cause(
                ErrorCode::PtyRequestFailed,
                "Failed to request pseudo-terminal",
                e,
            ));
        }

        debug!("PTY allocated, requesting shell");
        let shell_result = match channel.request_shell(true).await {
            Ok(()) => await_reply(&mut channel, "shell", &mut pending).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = shell_result {
            disconnect(&handle).await;
            return Err(AppError::with_cause(
                ErrorCode::ShellStartFailed,
                "Failed to start shell",
                e,
            ));
        }

        info!("Interactive shell started on {}", config.address());

        let label = format!("{}@{}", config.user, config.address());
        Ok(spawn_shell_owner_task(handle, channel, pending, label))
    }
}

/// Try each resolved mechanism in order until the server accepts one
async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    config: &CredentialConfig,
) -> Result<(), ShellError> {
    let methods = resolve_auth_methods(config);
    if methods.is_empty() {
        return Err(ShellError::AuthenticationFailed(
            "no usable authentication method".to_string(),
        ));
    }

    for method in methods {
        let result = match &method {
            AuthMechanism::Password(password) => {
                handle.authenticate_password(&config.user, password).await
            }
            AuthMechanism::PublicKey(key) => {
                let key_with_hash = PrivateKeyWithHashAlg::new(key.clone(), None);
                handle
                    .authenticate_publickey(&config.user, key_with_hash)
                    .await
            }
        };

        match result {
            Ok(outcome) if outcome.success() => return Ok(()),
            Ok(_) => debug!("{} authentication rejected for {}", method.name(), config.user),
            Err(e) => {
                return Err(ShellError::AuthenticationFailed(format!(
                    "{} authentication error: {}",
                    method.name(),
                    e
                )))
            }
        }
    }

    Err(ShellError::AuthenticationFailed(
        "Authentication rejected by server".to_string(),
    ))
}

/// Wait for the server's answer to a want-reply channel request
///
/// Output that races ahead of the reply is kept for the owner task.
async fn await_reply(
    channel: &mut Channel<Msg>,
    request: &'static str,
    pending: &mut Vec<ShellEvent>,
) -> Result<(), ShellError> {
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(()),
            Some(ChannelMsg::Failure) => return Err(ShellError::Refused(request)),
            Some(ChannelMsg::Data { data }) => pending.push(ShellEvent::Stdout(data.to_vec())),
            Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                pending.push(ShellEvent::Stderr(data.to_vec()))
            }
            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                return Err(ShellError::ChannelError(format!(
                    "channel closed while waiting for {} reply",
                    request
                )))
            }
            Some(_) => {}
        }
    }
}

async fn disconnect(handle: &Handle<ClientHandler>) {
    if let Err(e) = handle
        .disconnect(russh::Disconnect::ByApplication, "", "en")
        .await
    {
        warn!("Failed to disconnect SSH transport: {}", e);
    }
}

fn connection_failed(err: impl Into<ShellError>) -> AppError {
    AppError::with_cause(
        ErrorCode::SshConnectionFailed,
        "Failed to connect to SSH server",
        err.into(),
    )
}
