//! SSH module - remote shells over russh
//!
//! - Credential record decoding and auth method resolution
//! - Dialing and authenticating to the remote host (`SshConnector`)
//! - The shell owner task that serves one PTY channel

pub mod auth;
mod client;
mod config;
mod shell;

pub use auth::{resolve_auth_methods, AuthMechanism};
pub use client::{ClientHandler, SshConnector};
pub use config::{CredentialConfig, PtyConfig};
pub use shell::{
    spawn_shell_owner_task, ShellCommand, ShellConnector, ShellEndpoint, ShellError, ShellEvent,
    ShellIo,
};
