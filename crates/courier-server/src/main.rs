//! # courier-server
//!
//! Delivery server for the Courier chat subsystem.
//!
//! This binary provides:
//! - **WebSocket transport** with per-session auth, room-scoped fan-out,
//!   and heartbeat liveness
//! - **REST fallback** (axum) exposing the same delivery operations for
//!   clients without a live socket
//! - **SQLite persistence** for conversations, messages, read/unread
//!   bookkeeping, and public-key records
//! - **File attachment storage** with type and size validation

mod api;
mod auth;
mod config;
mod delivery;
mod error;
mod files;
mod rooms;
mod session;
mod ws;

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use courier_store::DatabasePool;

use crate::api::AppState;
use crate::auth::{ProfileDirectory, SessionTokens};
use crate::config::ServerConfig;
use crate::delivery::DeliveryCoordinator;
use crate::files::FileStore;
use crate::rooms::RoomRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_server=debug")),
        )
        .init();

    info!("Starting Courier server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Persistence (runs migrations on the pool's first connection)
    let pool = DatabasePool::new()?;
    info!(path = %pool.path().display(), "Database ready");

    // File attachment store (creates directory if missing)
    let files = Arc::new(
        FileStore::new(config.file_storage_path.clone(), config.max_file_size).await?,
    );

    // Live-session plumbing shared by the ws and REST paths
    let rooms = RoomRegistry::new();
    let profiles = ProfileDirectory::new();
    let auth = SessionTokens::new();

    let delivery = Arc::new(DeliveryCoordinator::new(
        pool,
        rooms.clone(),
        profiles.clone(),
    ));

    let http_addr = config.http_addr;
    let app_state = AppState {
        delivery,
        auth,
        profiles,
        rooms,
        files,
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 4. Run the HTTP server (blocks until shutdown)
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
