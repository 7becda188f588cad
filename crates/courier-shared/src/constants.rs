/// Separator used when joining the sorted participant pair into a
/// canonical conversation id.
pub const CONVERSATION_ID_SEPARATOR: &str = "_";

/// Maximum number of characters kept in the denormalized last-message
/// preview on a conversation.
pub const PREVIEW_MAX_CHARS: usize = 50;

/// Minimum plausible public key length in bytes. Shorter material is
/// rejected before fingerprint computation.
pub const MIN_PUBLIC_KEY_LEN: usize = 32;

/// XChaCha20-Poly1305 nonce size in bytes (the envelope's IV).
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes.
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Interval at which a connected client emits heartbeats.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 25;

/// Window within which the client expects a heartbeat ack before
/// treating the transport as dead.
pub const HEARTBEAT_ACK_WINDOW_SECS: u64 = 10;

/// Server-side inactivity timeout: a session that produces no heartbeat
/// for this long is closed and its user broadcast as offline.
pub const HEARTBEAT_TIMEOUT_SECS: u64 = 60;

/// Base delay for the client's exponential reconnect backoff.
pub const RECONNECT_BASE_DELAY_MS: u64 = 1_000;

/// Maximum number of reconnect attempts before falling back to polling.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 5;

/// Interval at which polling mode re-checks transport availability and
/// fetches new data over the REST fallback.
pub const POLL_INTERVAL_SECS: u64 = 15;

/// Maximum accepted file-message size in bytes (10 MiB).
pub const MAX_FILE_SIZE: usize = 10 * 1024 * 1024;

/// Default page size for message listing.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Default HTTP port for the courier server.
pub const DEFAULT_HTTP_PORT: u16 = 8080;
