//! SSH Configuration
//!
//! The credential record a peer sends in its `config` message, and the
//! terminal requested for every shell.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Credential record decoded from the peer's `config` payload
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialConfig {
    /// Remote host address
    pub host: String,

    /// SSH port, sent either as a number or a numeric string
    #[serde(default = "default_port", deserialize_with = "deserialize_port")]
    pub port: u16,

    #[serde(alias = "username")]
    pub user: String,

    #[serde(default, deserialize_with = "empty_as_none")]
    pub password: Option<String>,

    /// PEM/OpenSSH encoded private key
    #[serde(default, deserialize_with = "empty_as_none")]
    pub private_key: Option<String>,
}

fn default_port() -> u16 {
    22
}

impl CredentialConfig {
    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Secrets stay out of logs
impl fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u16),
    Text(String),
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    match PortValue::deserialize(deserializer)? {
        PortValue::Number(port) => Ok(port),
        PortValue::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port: {:?}", text))),
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

/// Pseudo-terminal requested when the shell starts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtyConfig {
    #[serde(default = "default_term")]
    pub term: String,

    #[serde(default = "default_cols")]
    pub cols: u32,

    #[serde(default = "default_rows")]
    pub rows: u32,

    /// Terminal input/output baud rate
    #[serde(default = "default_baud")]
    pub baud: u32,
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

fn default_cols() -> u32 {
    80
}

fn default_rows() -> u32 {
    40
}

fn default_baud() -> u32 {
    14400
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            term: default_term(),
            cols: default_cols(),
            rows: default_rows(),
            baud: default_baud(),
        }
    }
}

impl PtyConfig {
    /// Terminal modes: echo on, control-char echo off, fixed baud rate
    pub fn modes(&self) -> Vec<(russh::Pty, u32)> {
        vec![
            (russh::Pty::ECHO, 1),
            (russh::Pty::ECHOCTL, 0),
            (russh::Pty::TTY_OP_ISPEED, self.baud),
            (russh::Pty::TTY_OP_OSPEED, self.baud),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_numeric_port_and_user() {
        let config = CredentialConfig::from_json(
            r#"{"host":"example.com","port":2222,"user":"alice","password":"pw"}"#,
        )
        .unwrap();
        assert_eq!(config.host, "example.com");
        assert_eq!(config.port, 2222);
        assert_eq!(config.user, "alice");
        assert_eq!(config.password.as_deref(), Some("pw"));
        assert!(config.private_key.is_none());
        assert_eq!(config.address(), "example.com:2222");
    }

    #[test]
    fn test_decode_string_port_and_username_alias() {
        let config = CredentialConfig::from_json(
            r#"{"host":"10.0.0.1","port":"22","username":"bob","privateKey":"KEY"}"#,
        )
        .unwrap();
        assert_eq!(config.port, 22);
        assert_eq!(config.user, "bob");
        assert_eq!(config.private_key.as_deref(), Some("KEY"));
    }

    #[test]
    fn test_empty_secrets_are_absent() {
        let config = CredentialConfig::from_json(
            r#"{"host":"h","user":"u","password":"","privateKey":""}"#,
        )
        .unwrap();
        assert_eq!(config.port, 22);
        assert!(config.password.is_none());
        assert!(config.private_key.is_none());
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(CredentialConfig::from_json("not json").is_err());
        assert!(CredentialConfig::from_json(r#"{"host":"h","port":"abc","user":"u"}"#).is_err());
        assert!(CredentialConfig::from_json(r#"{"port":22,"user":"u"}"#).is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = CredentialConfig::from_json(
            r#"{"host":"h","user":"u","password":"hunter2","privateKey":"SECRET"}"#,
        )
        .unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("SECRET"));
    }
}
