//! Remote Shell Session
//!
//! The bridge core for one connection: owns the shell handle (through its
//! [`ShellIo`]), the bound peer channel and the one-shot termination
//! signal. The control loop and the output pump share it by `Arc`.
//!
//! # Termination
//!
//! The termination signal is a [`CancellationToken`] shared with the shell
//! owner task. Firing it closes the shell channel and the SSH transport;
//! [`RemoteShellSession::close`] fires it first and then closes the peer
//! channel. An atomic guard makes the teardown run exactly once no matter
//! how many tasks call `close` concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use super::protocol::ServerMessage;
use super::sender::SafeSender;
use crate::error::{AppError, ErrorCode};
use crate::ssh::{CredentialConfig, PtyConfig, ShellCommand, ShellConnector, ShellError, ShellEvent, ShellIo};

/// Largest payload carried by one `output` message
const OUTPUT_CHUNK_SIZE: usize = 4096;

pub struct RemoteShellSession {
    id: String,
    commands: mpsc::Sender<ShellCommand>,
    /// Only the output pump reads; the lock just hands it out
    output: Mutex<mpsc::Receiver<ShellEvent>>,
    peer: SafeSender,
    terminated: CancellationToken,
    closed: AtomicBool,
}

impl RemoteShellSession {
    /// Decode the credential payload and open a PTY shell for it
    ///
    /// Construction failures come back classified; any transport opened
    /// along the way has already been released by the connector.
    pub async fn start(
        connector: &dyn ShellConnector,
        cancel: &CancellationToken,
        id: String,
        payload: &str,
        pty: &PtyConfig,
        peer: SafeSender,
    ) -> Result<Arc<Self>, AppError> {
        let config = CredentialConfig::from_json(payload).map_err(|e| {
            AppError::with_cause(ErrorCode::InvalidConfig, "Invalid SSH configuration", e)
        })?;

        info!(
            "Starting shell for session {}: {}@{}",
            id,
            config.user,
            config.address()
        );

        let io = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(AppError::with_cause(
                    ErrorCode::SshConnectionFailed,
                    "Failed to connect to SSH server",
                    "connection attempt cancelled",
                ));
            }
            result = connector.open_shell(&config, pty) => result?,
        };

        Ok(Arc::new(Self::new(id, io, peer)))
    }

    pub fn new(id: String, io: ShellIo, peer: SafeSender) -> Self {
        Self {
            id,
            commands: io.commands,
            output: Mutex::new(io.output),
            peer,
            terminated: io.closed,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    /// Resolves once the session has begun shutting down
    pub fn terminated(&self) -> WaitForCancellationFuture<'_> {
        self.terminated.cancelled()
    }

    /// Forward shell output to the peer until cancellation, termination,
    /// end-of-stream or a read failure
    pub async fn pump_output(&self, cancel: CancellationToken) {
        let mut output = self.output.lock().await;
        let mut decoder = Utf8Decoder::default();

        debug!("Output pump started for session {}", self.id);

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Output pump for session {} stopped by cancellation", self.id);
                    return;
                }
                _ = self.terminated.cancelled() => {
                    debug!("Output pump for session {} stopped by termination", self.id);
                    return;
                }
                event = output.recv() => event,
            };

            match event {
                Some(ShellEvent::Stdout(data)) | Some(ShellEvent::Stderr(data)) => {
                    for chunk in data.chunks(OUTPUT_CHUNK_SIZE) {
                        let text = decoder.decode(chunk);
                        if text.is_empty() {
                            continue;
                        }
                        if let Err(e) = self.deliver(&ServerMessage::output(text)).await {
                            warn!("Peer for session {} stopped accepting output: {}", self.id, e);
                            self.close().await;
                            return;
                        }
                    }
                }
                Some(ShellEvent::Eof) => {
                    info!("Shell closed for session {}", self.id);
                    let closed = ServerMessage::ShellClosed {
                        message: "Shell session ended".to_string(),
                    };
                    if let Err(e) = self.deliver(&closed).await {
                        debug!("Could not announce shell end for {}: {}", self.id, e);
                    }
                    self.close().await;
                    return;
                }
                Some(ShellEvent::Failed(e)) => {
                    self.fail_output(e).await;
                    return;
                }
                None => {
                    self.fail_output(ShellError::Disconnected).await;
                    return;
                }
            }
        }
    }

    async fn fail_output(&self, cause: ShellError) {
        let err = AppError::with_cause(
            ErrorCode::OutputReadFailed,
            "Failed to read shell output",
            cause,
        );
        err.log();
        if !self.is_terminated() {
            self.peer.send_error(&err).await;
        }
        self.close().await;
    }

    /// Send to the peer unless the session is already shutting down
    async fn deliver(&self, message: &ServerMessage) -> Result<(), WsError> {
        if self.is_terminated() {
            return Ok(());
        }
        self.peer.send_message(message).await
    }

    /// Write bytes to the shell's stdin
    ///
    /// Failures are logged only: a dead shell surfaces through the output
    /// pump, which is the one path that reports it to the peer.
    pub async fn send_input(&self, data: Vec<u8>) {
        if self.is_terminated() {
            return;
        }
        if self.commands.send(ShellCommand::Input(data)).await.is_err() {
            warn!("Error sending input for session {}: shell is gone", self.id);
        }
    }

    /// Ask the remote PTY to change size
    pub async fn resize(&self, rows: u32, cols: u32) -> Result<(), AppError> {
        let failed = |cause: ShellError| {
            AppError::with_cause(ErrorCode::ResizeFailed, "Failed to resize terminal", cause)
        };

        if self.is_terminated() {
            return Err(failed(ShellError::Disconnected));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(ShellCommand::Resize {
                rows,
                cols,
                reply_tx,
            })
            .await
            .map_err(|_| failed(ShellError::Disconnected))?;

        reply_rx
            .await
            .map_err(|_| failed(ShellError::Disconnected))?
            .map_err(failed)?;

        debug!("Resized session {} to {}x{}", self.id, cols, rows);
        Ok(())
    }

    /// Tear the session down; runs once, later calls return immediately
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Closing session {}", self.id);
        self.terminated.cancel();
        self.peer.close().await;
    }
}

/// Incremental UTF-8 decoding across output chunks
///
/// A multi-byte sequence split by a read boundary is held back until the
/// rest arrives; invalid bytes become U+FFFD.
#[derive(Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);

        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + len..];
                        }
                        None => {
                            rest = &rest[valid..];
                            break;
                        }
                    }
                }
            }
        }

        let tail = rest.to_vec();
        self.pending = tail;
        out
    }
}
