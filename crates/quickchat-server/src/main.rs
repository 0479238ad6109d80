//! # quickchat-server
//!
//! Realtime one-to-one chat backend.
//!
//! This binary provides:
//! - **REST API** (axum) to send messages, read a conversation, mark messages
//!   as seen and query unseen counts
//! - **WebSocket endpoint** that authenticates each client, tracks who is
//!   online and pushes new messages to the recipient as they are stored
//! - **SQLite message store** so history survives restarts
//! - **Per-IP rate limiting** in front of the API

mod api;
mod auth;
mod config;
mod connection;
mod delivery;
mod error;
mod presence;
mod rate_limit;
mod store;

use std::time::Duration;

use quickchat_shared::constants::APP_NAME;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::store::MessageStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,quickchat_server=debug")),
        )
        .init();

    info!("Starting {} server v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the message store and wire up the components
    // -----------------------------------------------------------------------
    let store = MessageStore::open(&config.database_path)?;
    info!(path = %config.database_path.display(), "Message store ready");

    let http_addr = config.http_addr;
    let app_state = AppState::new(config, store);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = app_state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_idle(Duration::from_secs(600)).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP/WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
