//! Session Controller
//!
//! Drives one peer connection end to end:
//!
//! 1. register a `ClientRecord` under the connection's session id
//! 2. read the `config` message and start the remote shell
//! 3. run the output pump on its own task
//! 4. dispatch peer messages until the peer leaves, the shell ends, the
//!    caller cancels, or the peer sends the exit line
//! 5. close the session and remove the record, exactly once
//!
//! Step 5 runs from [`CleanupGuard`]: awaited on the normal path, spawned
//! from `Drop` if the controller future itself is dropped mid-flight.

use std::fmt;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{ClientMessage, ServerMessage};
use super::registry::{BufferedLine, ClientRecord, SessionRegistry};
use super::sender::SafeSender;
use super::session::RemoteShellSession;
use crate::config::{BridgeConfig, InputMode};
use crate::error::{AppError, ErrorCode};
use crate::ssh::{PtyConfig, ShellConnector};

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The caller's cancellation fired
    Cancelled,
    /// The session terminated (shell ended or pump failure)
    ShellClosed,
    /// The peer closed the channel
    PeerClosed,
    /// Reading from the peer failed
    ReadFailed,
    /// The peer sent the exit line
    ExitCommand,
    /// The remote shell could not be started
    StartFailed,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ExitReason::Cancelled => "cancelled",
            ExitReason::ShellClosed => "shell closed",
            ExitReason::PeerClosed => "peer closed",
            ExitReason::ReadFailed => "peer read failed",
            ExitReason::ExitCommand => "exit command",
            ExitReason::StartFailed => "shell start failed",
        };
        f.write_str(text)
    }
}

/// One decoded read from the peer
enum Inbound {
    Message(ClientMessage),
    Closed,
    Failed(AppError),
}

enum Flow {
    Continue,
    Exit,
}

#[derive(Clone)]
pub struct SessionController {
    registry: Arc<SessionRegistry>,
    connector: Arc<dyn ShellConnector>,
    pty: PtyConfig,
    input_mode: InputMode,
}

impl SessionController {
    pub fn new(
        registry: Arc<SessionRegistry>,
        connector: Arc<dyn ShellConnector>,
        config: &BridgeConfig,
    ) -> Self {
        Self {
            registry,
            connector,
            pty: config.pty.clone(),
            input_mode: config.input_mode,
        }
    }

    /// Serve one upgraded peer channel until it ends
    ///
    /// `client_key` is the identifier supplied by the upgrade step.
    pub async fn run<S>(
        &self,
        ws: WebSocketStream<S>,
        client_key: Option<String>,
        cancel: CancellationToken,
    ) -> ExitReason
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, mut stream) = ws.split();
        let sender = SafeSender::new(sink);

        let Some(key) = client_key.filter(|k| !k.is_empty()) else {
            let err = AppError::new(ErrorCode::MissingClientId, "Sec-WebSocket-Key not provided");
            sender.report(&err).await;
            sender.close().await;
            return ExitReason::StartFailed;
        };

        let client = self.register(key, &sender).await;
        let guard = CleanupGuard::new(self.registry.clone(), client.id().to_string());
        let scope = cancel.child_token();

        let reason = self.drive(&client, &mut stream, &scope).await;
        info!("Session {} ended: {}", client.id(), reason);

        scope.cancel();
        guard.finish().await;
        reason
    }

    async fn register(&self, key: String, sender: &SafeSender) -> Arc<ClientRecord> {
        let client = Arc::new(ClientRecord::new(key.clone(), sender.clone()));
        if self.registry.try_put(key.clone(), client.clone()).await {
            info!("Client {} connected", key);
            return client;
        }

        // Keys are client-chosen; fall back to a generated id on collision
        let id = uuid::Uuid::new_v4().to_string();
        warn!("Client key {} already registered, using session id {}", key, id);
        let client = Arc::new(ClientRecord::new(id.clone(), sender.clone()));
        self.registry.put(id, client.clone()).await;
        client
    }

    async fn drive<St>(
        &self,
        client: &Arc<ClientRecord>,
        stream: &mut St,
        scope: &CancellationToken,
    ) -> ExitReason
    where
        St: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let sender = client.sender();

        let inbound = tokio::select! {
            biased;
            _ = scope.cancelled() => return ExitReason::Cancelled,
            inbound = read_inbound(stream) => inbound,
        };
        let payload = match inbound {
            Inbound::Message(ClientMessage::Config { content }) => content,
            Inbound::Message(_) => {
                let err = AppError::new(
                    ErrorCode::InvalidConfig,
                    "Expected a config message first",
                );
                sender.report(&err).await;
                return ExitReason::StartFailed;
            }
            Inbound::Closed => return ExitReason::PeerClosed,
            Inbound::Failed(err) => {
                sender.report(&err).await;
                return ExitReason::ReadFailed;
            }
        };

        let session = match RemoteShellSession::start(
            self.connector.as_ref(),
            scope,
            client.id().to_string(),
            &payload,
            &self.pty,
            sender.clone(),
        )
        .await
        {
            Ok(session) => session,
            Err(err) => {
                sender.report(&err).await;
                return ExitReason::StartFailed;
            }
        };

        client.attach(session.clone());

        if let Err(e) = sender
            .send_message(&ServerMessage::Connected {
                message: "SSH session established".to_string(),
            })
            .await
        {
            debug!("Could not announce session {}: {}", client.id(), e);
        }

        let pump = tokio::spawn({
            let session = session.clone();
            let scope = scope.clone();
            async move { session.pump_output(scope).await }
        });

        let reason = self.message_loop(client, &session, stream, scope).await;

        session.close().await;
        if let Err(e) = pump.await {
            warn!("Output pump for session {} panicked: {}", client.id(), e);
        }
        reason
    }

    async fn message_loop<St>(
        &self,
        client: &ClientRecord,
        session: &RemoteShellSession,
        stream: &mut St,
        scope: &CancellationToken,
    ) -> ExitReason
    where
        St: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        let sender = client.sender();

        loop {
            let inbound = tokio::select! {
                biased;
                _ = scope.cancelled() => return ExitReason::Cancelled,
                _ = session.terminated() => return ExitReason::ShellClosed,
                inbound = read_inbound(stream) => inbound,
            };

            let message = match inbound {
                Inbound::Message(message) => message,
                Inbound::Closed => return ExitReason::PeerClosed,
                Inbound::Failed(err) => {
                    sender.report(&err).await;
                    return ExitReason::ReadFailed;
                }
            };

            match message {
                ClientMessage::Input { content } => {
                    if let Flow::Exit = self.handle_input(client, session, content).await {
                        return ExitReason::ExitCommand;
                    }
                }
                ClientMessage::Command { command } => {
                    if let Flow::Exit = self.handle_input(client, session, command).await {
                        return ExitReason::ExitCommand;
                    }
                }
                ClientMessage::Resize { rows, cols } => {
                    debug!("Resize request {}x{} for session {}", cols, rows, client.id());
                    if let Err(err) = session.resize(rows, cols).await {
                        sender.report(&err).await;
                    }
                }
                ClientMessage::Config { .. } | ClientMessage::Unknown => {
                    let err = AppError::new(
                        ErrorCode::UnknownMessageType,
                        "Unknown message type received",
                    );
                    sender.report(&err).await;
                }
            }
        }
    }

    async fn handle_input(
        &self,
        client: &ClientRecord,
        session: &RemoteShellSession,
        text: String,
    ) -> Flow {
        match self.input_mode {
            InputMode::Raw => {
                session.send_input(text.into_bytes()).await;
                Flow::Continue
            }
            InputMode::Line => match client.buffer_input(&text) {
                BufferedLine::Pending => Flow::Continue,
                BufferedLine::Line(line) => {
                    session.send_input(line.into_bytes()).await;
                    Flow::Continue
                }
                BufferedLine::Exit => {
                    info!("Exit command received for session {}", client.id());
                    if let Err(e) = client
                        .sender()
                        .send_message(&ServerMessage::Disconnected {
                            message: "Session closed".to_string(),
                        })
                        .await
                    {
                        debug!("Could not announce exit for {}: {}", client.id(), e);
                    }
                    session.close().await;
                    Flow::Exit
                }
            },
        }
    }
}

async fn read_inbound<St>(stream: &mut St) -> Inbound
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                return Inbound::Failed(AppError::with_cause(
                    ErrorCode::WsReadFailed,
                    "Failed to read WebSocket message",
                    e,
                ))
            }
            None => return Inbound::Closed,
        };

        let decoded = match frame {
            Message::Text(text) => ClientMessage::decode(&text),
            Message::Binary(data) => ClientMessage::decode_bytes(&data),
            Message::Close(_) => return Inbound::Closed,
            // Ping/pong are answered by tungstenite
            _ => continue,
        };

        return match decoded {
            Ok(message) => Inbound::Message(message),
            Err(e) => Inbound::Failed(AppError::with_cause(
                ErrorCode::WsReadFailed,
                "Failed to read WebSocket message",
                e,
            )),
        };
    }
}

/// Removes a session from the registry exactly once
struct CleanupGuard {
    registry: Arc<SessionRegistry>,
    id: Option<String>,
}

impl CleanupGuard {
    fn new(registry: Arc<SessionRegistry>, id: String) -> Self {
        Self {
            registry,
            id: Some(id),
        }
    }

    async fn finish(mut self) {
        if let Some(id) = self.id.take() {
            self.registry.remove_and_cleanup(&id).await;
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!("Session {} dropped before cleanup, cleaning up in background", id);
                let registry = self.registry.clone();
                runtime.spawn(async move {
                    registry.remove_and_cleanup(&id).await;
                });
            }
            Err(_) => warn!("Session {} dropped outside a runtime, cleanup skipped", id),
        }
    }
}
