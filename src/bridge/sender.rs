//! Serialized writes to one peer channel
//!
//! The output pump and the control loop both write to the same WebSocket.
//! [`SafeSender`] puts the sink behind a per-client async lock so frames
//! never interleave. This lock is independent of the `ClientRecord` state
//! lock; neither is ever held while acquiring the other.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, warn};

use super::protocol::ServerMessage;
use crate::error::AppError;

/// Write deadline; a peer that stops reading is treated as gone
const SEND_TIMEOUT_SECS: u64 = 5;

pub type PeerSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

#[derive(Clone)]
pub struct SafeSender {
    sink: Arc<Mutex<Option<PeerSink>>>,
}

impl SafeSender {
    pub fn new<S>(sink: S) -> Self
    where
        S: Sink<Message, Error = WsError> + Send + 'static,
    {
        Self {
            sink: Arc::new(Mutex::new(Some(Box::pin(sink)))),
        }
    }

    /// A sender with no peer behind it; every send is a no-op
    pub fn detached() -> Self {
        Self {
            sink: Arc::new(Mutex::new(None)),
        }
    }

    /// Send one envelope. A closed or absent peer is not an error.
    pub async fn send_message(&self, message: &ServerMessage) -> Result<(), WsError> {
        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Ok(());
        };

        match tokio::time::timeout(
            Duration::from_secs(SEND_TIMEOUT_SECS),
            sink.send(Message::Text(message.to_json())),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(WsError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "peer send timed out",
            ))),
        }
    }

    /// Peer-facing error notification, best-effort
    pub async fn send_error(&self, err: &AppError) {
        if let Err(e) = self.send_message(&ServerMessage::error(err)).await {
            debug!("Could not deliver {} to peer: {}", err.code(), e);
        }
    }

    /// Log once and notify the peer once
    pub async fn report(&self, err: &AppError) {
        err.log();
        self.send_error(err).await;
    }

    /// Close the peer channel. Later sends become no-ops.
    ///
    /// A peer that does not take the close frame within the send deadline
    /// is dropped without it.
    pub async fn close(&self) {
        let sink = self.sink.lock().await.take();
        let Some(mut sink) = sink else {
            return;
        };
        match tokio::time::timeout(Duration::from_secs(SEND_TIMEOUT_SECS), sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Peer channel close returned: {}", e),
            Err(_) => warn!("Peer did not accept close frame within {}s, dropping", SEND_TIMEOUT_SECS),
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.sink.lock().await.is_none()
    }
}
