//! WebSocket server for the SSH bridge
//!
//! Accepts TCP connections, upgrades those that target the configured
//! path, and hands each upgraded channel to a [`SessionController`] task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::SEC_WEBSOCKET_KEY, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::controller::SessionController;
use super::registry::SessionRegistry;
use crate::config::{BridgeConfig, ConfigError};
use crate::error::{AppError, ErrorCode};
use crate::ssh::ShellConnector;

/// How long shutdown waits for live sessions to wind down
const DRAIN_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to bind WebSocket server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// WebSocket bridge server
pub struct BridgeServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    path: String,
    handshake_timeout: Duration,
    registry: Arc<SessionRegistry>,
    controller: SessionController,
}

impl BridgeServer {
    pub async fn bind(
        config: &BridgeConfig,
        connector: Arc<dyn ShellConnector>,
    ) -> Result<Self, ServerError> {
        let addr = config.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let registry = Arc::new(SessionRegistry::new());
        let controller = SessionController::new(registry.clone(), connector, config);

        info!(
            "WebSocket bridge listening on ws://{}{}",
            local_addr, config.path
        );

        Ok(Self {
            listener,
            local_addr,
            path: config.path.clone(),
            handshake_timeout: config.handshake_timeout(),
            registry,
            controller,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Accept connections until `shutdown` fires, then wait briefly for
    /// the sessions it cancelled to clean up
    pub async fn serve(self, shutdown: CancellationToken) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        connections.spawn(handle_connection(
                            stream,
                            addr,
                            self.path.clone(),
                            self.handshake_timeout,
                            self.controller.clone(),
                            shutdown.child_token(),
                        ));
                    }
                    Err(e) => {
                        warn!("Failed to accept TCP connection: {}", e);
                    }
                },
            }
        }

        info!(
            "WebSocket bridge shutting down, {} connection(s) open",
            connections.len()
        );
        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(Duration::from_secs(DRAIN_TIMEOUT_SECS), drain)
            .await
            .is_err()
        {
            warn!("Connections still open after shutdown deadline, aborting");
            connections.abort_all();
        }
        info!("WebSocket bridge stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    path: String,
    handshake_timeout: Duration,
    controller: SessionController,
    cancel: CancellationToken,
) {
    // Interactive traffic: no Nagle batching
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }

    let mut client_key = None;
    let callback = |request: &Request, response: Response| {
        if request.uri().path() != path {
            debug!("Rejecting upgrade for {} from {}", request.uri().path(), addr);
            let mut rejection = ErrorResponse::new(Some("Not Found".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            return Err(rejection);
        }
        client_key = request
            .headers()
            .get(SEC_WEBSOCKET_KEY)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Ok(response)
    };

    let ws = match tokio::time::timeout(handshake_timeout, accept_hdr_async(stream, callback)).await
    {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            AppError::with_cause(
                ErrorCode::WsUpgradeFailed,
                "Failed to upgrade connection",
                e,
            )
            .log();
            return;
        }
        Err(_) => {
            AppError::with_cause(
                ErrorCode::WsUpgradeFailed,
                "Failed to upgrade connection",
                format!("no handshake from {} within {:?}", addr, handshake_timeout),
            )
            .log();
            return;
        }
    };

    info!("WebSocket connection from {}", addr);
    controller.run(ws, client_key, cancel).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testutil::{config_message, FakeConnector};
    use crate::ssh::{ShellCommand, ShellIo};
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message;

    async fn bound(connector: FakeConnector) -> BridgeServer {
        let config = BridgeConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        };
        BridgeServer::bind(&config, Arc::new(connector)).await.unwrap()
    }

    #[tokio::test]
    async fn test_serves_session_over_tcp() {
        let (io, mut endpoint) = ShellIo::pair();
        let server = bound(FakeConnector::succeeding(io)).await;
        let addr = server.local_addr();
        let registry = server.registry().clone();
        let shutdown = CancellationToken::new();
        let serving = tokio::spawn(server.serve(shutdown.clone()));

        let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        ws.send(Message::Text(config_message("example.com").to_string()))
            .await
            .unwrap();

        let connected = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => break text,
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        };
        assert!(connected.contains(r#""type":"connected""#));
        assert_eq!(registry.len().await, 1);

        ws.send(Message::Text(r#"{"type":"input","content":"id\n"}"#.to_string()))
            .await
            .unwrap();
        assert!(matches!(
            endpoint.commands.recv().await,
            Some(ShellCommand::Input(data)) if data == b"id\n"
        ));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), serving)
            .await
            .unwrap()
            .unwrap();
        assert!(registry.is_empty().await);
        assert!(endpoint.closed.is_cancelled());
    }

    #[tokio::test]
    async fn test_rejects_other_paths() {
        let (io, _endpoint) = ShellIo::pair();
        let server = bound(FakeConnector::succeeding(io)).await;
        let addr = server.local_addr();
        let shutdown = CancellationToken::new();
        let serving = tokio::spawn(server.serve(shutdown.clone()));

        assert!(connect_async(format!("ws://{}/elsewhere", addr)).await.is_err());

        shutdown.cancel();
        serving.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_reports_invalid_address() {
        let config = BridgeConfig {
            bind_addr: "not an address".to_string(),
            ..Default::default()
        };
        let (io, _endpoint) = ShellIo::pair();
        let result = BridgeServer::bind(&config, Arc::new(FakeConnector::succeeding(io))).await;
        assert!(matches!(result, Err(ServerError::Config(_))));
    }
}
