//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use courier_shared::constants::{DEFAULT_PAGE_SIZE, HEARTBEAT_TIMEOUT_SECS, MAX_FILE_SIZE};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) server, which carries both the
    /// REST fallback and the WebSocket upgrade endpoint.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Filesystem path where file-message attachments are stored.
    /// Env: `FILE_STORAGE_PATH`
    /// Default: `./files`
    pub file_storage_path: PathBuf,

    /// Maximum accepted file-message size in bytes.
    /// Env: `MAX_FILE_SIZE`
    pub max_file_size: usize,

    /// Inactivity window after which a live session with no heartbeat is
    /// closed and broadcast as offline.
    /// Env: `HEARTBEAT_TIMEOUT_SECS`
    pub heartbeat_timeout: Duration,

    /// Default page size for message listing.
    /// Env: `PAGE_SIZE`
    pub page_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            file_storage_path: PathBuf::from("./files"),
            max_file_size: MAX_FILE_SIZE,
            heartbeat_timeout: Duration::from_secs(HEARTBEAT_TIMEOUT_SECS),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl ServerConfig {
    /// Build a configuration from the environment, falling back to the
    /// defaults above for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            http_addr: read_env("HTTP_ADDR").unwrap_or(defaults.http_addr),
            file_storage_path: std::env::var("FILE_STORAGE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.file_storage_path),
            max_file_size: read_env("MAX_FILE_SIZE").unwrap_or(defaults.max_file_size),
            heartbeat_timeout: read_env("HEARTBEAT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_timeout),
            page_size: read_env("PAGE_SIZE").unwrap_or(defaults.page_size),
        }
    }
}

fn read_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
