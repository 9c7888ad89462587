//! Shell Owner Task
//!
//! One task owns the russh `Channel` and the connection `Handle` for a
//! shell. Everything else talks to it through a [`ShellIo`]:
//!
//! - `commands`: input bytes and window-change requests, in send order
//! - `output`: stdout/stderr chunks, then exactly one terminal event
//! - `closed`: a broadcast close signal; firing it makes the owner task send
//!   EOF, close the channel and disconnect the transport
//!
//! Keeping the channel in a single task means no lock is ever held across
//! an SSH write, and the output reader and the input writer never contend.

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::config::{CredentialConfig, PtyConfig};
use crate::error::AppError;

/// Command queue depth between the bridge and the owner task
const COMMAND_CHANNEL_CAPACITY: usize = 256;
/// Output queue depth; bounded so a slow peer applies backpressure to SSH
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum ShellError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Request refused by server: {0}")]
    Refused(&'static str),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Disconnected")]
    Disconnected,
}

impl From<russh::Error> for ShellError {
    fn from(err: russh::Error) -> Self {
        ShellError::ProtocolError(err.to_string())
    }
}

/// Commands served by the owner task
#[derive(Debug)]
pub enum ShellCommand {
    /// Bytes for the shell's stdin
    Input(Vec<u8>),
    /// Window change; the outcome is reported back
    Resize {
        rows: u32,
        cols: u32,
        reply_tx: oneshot::Sender<Result<(), ShellError>>,
    },
}

/// Events produced by the owner task
#[derive(Debug)]
pub enum ShellEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// The shell ended normally (EOF, channel close or exit)
    Eof,
    /// The remote side went away without ending the shell
    Failed(ShellError),
}

/// The bridge's view of one running shell
pub struct ShellIo {
    pub commands: mpsc::Sender<ShellCommand>,
    pub output: mpsc::Receiver<ShellEvent>,
    pub closed: CancellationToken,
}

impl ShellIo {
    /// Wire up an in-memory shell; the returned [`ShellEndpoint`] plays the
    /// remote side
    pub fn pair() -> (ShellIo, ShellEndpoint) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let closed = CancellationToken::new();
        (
            ShellIo {
                commands: cmd_tx,
                output: out_rx,
                closed: closed.clone(),
            },
            ShellEndpoint {
                commands: cmd_rx,
                output: out_tx,
                closed,
            },
        )
    }
}

/// Remote end of a [`ShellIo`]
pub struct ShellEndpoint {
    pub commands: mpsc::Receiver<ShellCommand>,
    pub output: mpsc::Sender<ShellEvent>,
    pub closed: CancellationToken,
}

/// Opens a PTY-backed shell for a credential record
#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn open_shell(
        &self,
        config: &CredentialConfig,
        pty: &PtyConfig,
    ) -> Result<ShellIo, AppError>;
}

/// Spawn the owner task for an established shell channel
pub fn spawn_shell_owner_task(
    handle: Handle<ClientHandler>,
    channel: Channel<Msg>,
    pending: Vec<ShellEvent>,
    label: String,
) -> ShellIo {
    let (io, endpoint) = ShellIo::pair();
    tokio::spawn(run_owner(handle, channel, pending, endpoint, label));
    io
}

async fn run_owner(
    handle: Handle<ClientHandler>,
    mut channel: Channel<Msg>,
    pending: Vec<ShellEvent>,
    endpoint: ShellEndpoint,
    label: String,
) {
    let ShellEndpoint {
        commands: mut cmd_rx,
        output: out_tx,
        closed,
    } = endpoint;

    info!("Shell owner task started for {}", label);

    if !forward_pending(pending, &out_tx, &closed).await {
        debug!("Output receiver dropped before shell start for {}", label);
    }

    let mut ended = false;
    loop {
        tokio::select! {
            biased;

            _ = closed.cancelled() => {
                debug!("Close signal received for {}", label);
                break;
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ShellCommand::Input(data)) => {
                        if let Err(e) = channel.data(&data[..]).await {
                            warn!("Failed to write to shell stdin for {}: {}", label, e);
                        }
                    }
                    Some(ShellCommand::Resize { rows, cols, reply_tx }) => {
                        debug!("Sending window_change: {}x{} for {}", cols, rows, label);
                        let result = channel
                            .window_change(cols, rows, 0, 0)
                            .await
                            .map_err(ShellError::from);
                        let _ = reply_tx.send(result);
                    }
                    None => {
                        debug!("Command channel dropped for {}", label);
                        break;
                    }
                }
            }

            msg = channel.wait(), if !ended => {
                let event = match msg {
                    Some(ChannelMsg::Data { data }) => ShellEvent::Stdout(data.to_vec()),
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        if ext != 1 {
                            continue;
                        }
                        ShellEvent::Stderr(data.to_vec())
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        info!("Shell exit status {} for {}", exit_status, label);
                        continue;
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        info!("Shell exit signal {:?} for {}", signal_name, label);
                        continue;
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => {
                        info!("Shell channel ended for {}", label);
                        ended = true;
                        ShellEvent::Eof
                    }
                    Some(_) => continue,
                    None => {
                        warn!("SSH channel dropped without EOF for {}", label);
                        ended = true;
                        ShellEvent::Failed(ShellError::Disconnected)
                    }
                };
                if out_tx.send(event).await.is_err() {
                    debug!("Output receiver dropped for {}", label);
                    break;
                }
            }
        }
    }

    let _ = channel.eof().await;
    let _ = channel.close().await;
    if let Err(e) = handle
        .disconnect(Disconnect::ByApplication, "", "en")
        .await
    {
        debug!("Disconnect for {} returned: {}", label, e);
    }

    info!("Shell owner task terminated for {}", label);
}

/// Hand output that raced ahead of the shell reply to the bridge
///
/// Returns false, with `closed` fired, once the receiver is gone.
async fn forward_pending(
    pending: Vec<ShellEvent>,
    out_tx: &mpsc::Sender<ShellEvent>,
    closed: &CancellationToken,
) -> bool {
    for event in pending {
        if out_tx.send(event).await.is_err() {
            closed.cancel();
            return false;
        }
    }
    true
}
