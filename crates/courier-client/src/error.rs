use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// Structured error returned by the server ({code}: {message}).
    #[error("server rejected the request ({code}): {message}")]
    Server { code: String, message: String },

    #[error("undecodable server payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// The live connection is gone; the controller will reconnect.
    #[error("connection closed")]
    Closed,
}
