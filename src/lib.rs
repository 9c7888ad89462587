//! wssh-bridge - browser terminals driving remote PTY shells
//!
//! Each WebSocket peer sends one credential record, gets an SSH shell on
//! the host it names, and then exchanges keystrokes and output with it.

// mimalloc: many small frame allocations per keystroke
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod bridge;
pub mod config;
pub mod error;
pub mod ssh;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::bridge::BridgeServer;
use crate::config::BridgeConfig;
use crate::ssh::SshConnector;

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Process entry point; returns the exit code
pub fn run() -> i32 {
    init_logging();

    let config = match BridgeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return 1;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start async runtime: {}", e);
            return 1;
        }
    };

    runtime.block_on(async move {
        let connector = Arc::new(SshConnector::new(config.connect_timeout()));
        let server = match BridgeServer::bind(&config, connector).await {
            Ok(server) => server,
            Err(e) => {
                error!("{}", e);
                return 1;
            }
        };

        let shutdown = CancellationToken::new();
        tokio::spawn({
            let shutdown = shutdown.clone();
            async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for interrupt: {}", e);
                    return;
                }
                info!("Interrupt received, shutting down");
                shutdown.cancel();
            }
        });

        server.serve(shutdown).await;
        0
    })
}
