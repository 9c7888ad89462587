//! Classified bridge errors
//!
//! Every failure the bridge reports to a peer is an [`AppError`]: a stable
//! [`ErrorCode`], a message that is safe to show the peer, and an optional
//! cause kept for the operational log only.

use std::error::Error as StdError;
use std::fmt;

use serde::Serialize;
use tracing::error;

type Cause = Box<dyn StdError + Send + Sync + 'static>;

/// Stable, machine-readable failure codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Credential payload could not be decoded
    InvalidConfig,
    /// Dial or authentication to the remote host failed
    SshConnectionFailed,
    SshSessionCreationFailed,
    StdinPipeFailed,
    StdoutPipeFailed,
    StderrPipeFailed,
    PtyRequestFailed,
    ShellStartFailed,
    /// Unexpected failure reading shell output (end-of-stream is not this)
    OutputReadFailed,
    ResizeFailed,
    WsUpgradeFailed,
    MissingClientId,
    WsReadFailed,
    UnknownMessageType,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
            ErrorCode::SshConnectionFailed => "SSH_CONNECTION_FAILED",
            ErrorCode::SshSessionCreationFailed => "SSH_SESSION_CREATION_FAILED",
            ErrorCode::StdinPipeFailed => "STDIN_PIPE_FAILED",
            ErrorCode::StdoutPipeFailed => "STDOUT_PIPE_FAILED",
            ErrorCode::StderrPipeFailed => "STDERR_PIPE_FAILED",
            ErrorCode::PtyRequestFailed => "PTY_REQUEST_FAILED",
            ErrorCode::ShellStartFailed => "SHELL_START_FAILED",
            ErrorCode::OutputReadFailed => "OUTPUT_READ_FAILED",
            ErrorCode::ResizeFailed => "RESIZE_FAILED",
            ErrorCode::WsUpgradeFailed => "WS_UPGRADE_FAILED",
            ErrorCode::MissingClientId => "MISSING_CLIENT_ID",
            ErrorCode::WsReadFailed => "WS_READ_FAILED",
            ErrorCode::UnknownMessageType => "UNKNOWN_MESSAGE_TYPE",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure
///
/// The cause is retained for diagnostics (`source()`, [`AppError::render`],
/// the log line) and is never part of what the peer sees.
#[derive(Debug)]
pub struct AppError {
    code: ErrorCode,
    message: String,
    cause: Option<Cause>,
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn with_cause<E>(code: ErrorCode, message: impl Into<String>, cause: E) -> Self
    where
        E: Into<Cause>,
    {
        Self {
            code,
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Peer-safe message
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// `[CODE] message: cause`, or `[CODE] message` without a cause
    pub fn render(&self) -> String {
        match &self.cause {
            Some(cause) => format!("[{}] {}: {}", self.code, self.message, cause),
            None => format!("[{}] {}", self.code, self.message),
        }
    }

    pub fn log(&self) {
        error!("{}", self.render());
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl StdError for AppError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}
