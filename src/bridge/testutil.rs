//! Shared fixtures for bridge tests: in-memory WebSocket pairs and a
//! scripted shell connector.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{AppError, ErrorCode};
use crate::ssh::{CredentialConfig, PtyConfig, ShellConnector, ShellIo};

pub type TestSocket = WebSocketStream<DuplexStream>;

const FRAME_WAIT: Duration = Duration::from_secs(5);

/// Connected (server, client) WebSocket ends over an in-memory pipe
pub async fn ws_pair() -> (TestSocket, TestSocket) {
    ws_pair_with_capacity(64 * 1024).await
}

/// Like [`ws_pair`] with a chosen pipe buffer; a small buffer plus a peer
/// that never reads gives a stalled writer
pub async fn ws_pair_with_capacity(capacity: usize) -> (TestSocket, TestSocket) {
    let (server_io, client_io) = tokio::io::duplex(capacity);
    let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    (server, client)
}

/// Next data or close frame; `None` once the stream ends or stalls
pub async fn next_frame(socket: &mut TestSocket) -> Option<Message> {
    loop {
        match tokio::time::timeout(FRAME_WAIT, socket.next()).await {
            Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
            Ok(Some(Ok(msg))) => return Some(msg),
            _ => return None,
        }
    }
}

/// Next text frame decoded as JSON
pub async fn next_json(socket: &mut TestSocket) -> Option<serde_json::Value> {
    match next_frame(socket).await? {
        Message::Text(text) => serde_json::from_str(&text).ok(),
        _ => None,
    }
}

pub async fn send_json(socket: &mut TestSocket, value: serde_json::Value) {
    socket
        .send(Message::Text(value.to_string()))
        .await
        .expect("test peer send");
}

pub fn config_message(host: &str) -> serde_json::Value {
    let creds = serde_json::json!({
        "host": host,
        "port": 22,
        "user": "tester",
        "password": "secret",
    });
    serde_json::json!({ "type": "config", "content": creds.to_string() })
}

/// Connector that hands out one prepared shell, or fails with a fixed code
pub struct FakeConnector {
    outcome: Mutex<Option<Result<ShellIo, AppError>>>,
    pub requested: Mutex<Vec<CredentialConfig>>,
}

impl FakeConnector {
    pub fn succeeding(io: ShellIo) -> Self {
        Self {
            outcome: Mutex::new(Some(Ok(io))),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(code: ErrorCode, message: &str) -> Self {
        Self {
            outcome: Mutex::new(Some(Err(AppError::new(code, message)))),
            requested: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ShellConnector for FakeConnector {
    async fn open_shell(
        &self,
        config: &CredentialConfig,
        _pty: &PtyConfig,
    ) -> Result<ShellIo, AppError> {
        self.requested.lock().push(config.clone());
        self.outcome.lock().take().unwrap_or_else(|| {
            Err(AppError::new(
                ErrorCode::SshConnectionFailed,
                "Failed to connect to SSH server",
            ))
        })
    }
}
