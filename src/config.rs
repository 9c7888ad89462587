//! Bridge Configuration
//!
//! Process-level settings read from the environment at startup.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ssh::PtyConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// How `input`/`command` messages reach the shell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Every keystroke message is written to the shell as-is
    #[default]
    Raw,
    /// Fragments accumulate until a line terminator, then flush as one write
    Line,
}

impl std::str::FromStr for InputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(InputMode::Raw),
            "line" | "line_buffered" => Ok(InputMode::Line),
            other => Err(format!("expected raw or line, got {}", other)),
        }
    }
}

/// Bridge server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Listen address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request path that accepts WebSocket upgrades
    #[serde(default = "default_path")]
    pub path: String,

    /// Remote dial timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// WebSocket upgrade deadline in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    #[serde(default)]
    pub input_mode: InputMode,

    /// Initial terminal requested for every shell
    #[serde(default)]
    pub pty: PtyConfig,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_path() -> String {
    "/ws".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_handshake_timeout() -> u64 {
    30
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            path: default_path(),
            connect_timeout_secs: default_connect_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            input_mode: InputMode::default(),
            pty: PtyConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Build from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; unset variables keep defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("WSSH_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(port) = lookup("PORT") {
            config.port = parse_var("PORT", port)?;
        }
        if let Some(path) = lookup("WSSH_PATH") {
            config.path = if path.starts_with('/') {
                path
            } else {
                format!("/{}", path)
            };
        }
        if let Some(secs) = lookup("WSSH_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout_secs = parse_var("WSSH_CONNECT_TIMEOUT_SECS", secs)?;
        }
        if let Some(secs) = lookup("WSSH_HANDSHAKE_TIMEOUT_SECS") {
            config.handshake_timeout_secs = parse_var("WSSH_HANDSHAKE_TIMEOUT_SECS", secs)?;
        }
        if let Some(mode) = lookup("WSSH_INPUT_MODE") {
            config.input_mode = parse_var("WSSH_INPUT_MODE", mode)?;
        }
        if let Some(term) = lookup("WSSH_TERM") {
            config.pty.term = term;
        }
        if let Some(cols) = lookup("WSSH_COLS") {
            config.pty.cols = parse_var("WSSH_COLS", cols)?;
        }
        if let Some(rows) = lookup("WSSH_ROWS") {
            config.pty.rows = parse_var("WSSH_ROWS", rows)?;
        }

        Ok(config)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.bind_addr, self.port);
        raw.parse().map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
            name: "WSSH_BIND_ADDR",
            value: raw.clone(),
            reason: e.to_string(),
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

fn parse_var<T>(name: &'static str, value: String) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        name,
        reason: e.to_string(),
        value,
    })
}
