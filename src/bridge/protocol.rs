//! Peer wire protocol
//!
//! JSON text envelopes tagged by `type`. Decoding happens once, up front,
//! into closed enums; an unrecognized tag decodes to
//! [`ClientMessage::Unknown`] instead of falling through.

use serde::{Deserialize, Serialize};

use crate::error::{AppError, ErrorCode};

/// Messages sent by the peer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Credential record, as a JSON-encoded string
    Config { content: String },
    /// Raw keystrokes
    Input { content: String },
    /// Command text (line-buffered clients)
    Command { command: String },
    Resize { rows: u32, cols: u32 },
    #[serde(other)]
    Unknown,
}

impl ClientMessage {
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn decode_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Messages sent to the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Terminal output, escape sequences included
    Output { content: String },
    Error { code: ErrorCode, content: String },
    Connected { message: String },
    Disconnected { message: String },
    ShellClosed { message: String },
}

impl ServerMessage {
    pub fn output(content: impl Into<String>) -> Self {
        ServerMessage::Output {
            content: content.into(),
        }
    }

    /// Peer-facing form of an error; the cause is deliberately left out
    pub fn error(err: &AppError) -> Self {
        ServerMessage::Error {
            code: err.code(),
            content: err.message().to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        // Plain enum of strings and integers; serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}
