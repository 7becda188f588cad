use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use courier_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Missing or malformed required field; rejected before any persistence.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The caller is authenticated but not allowed to do this.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Referenced conversation/message/user is absent.
    #[error("Not found")]
    NotFound,

    /// No usable caller identity on a path that requires one.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("File too large: {size} bytes (max {max})")]
    FileTooLarge { size: usize, max: usize },

    /// Persistence-layer failure; session state is untouched so the
    /// caller may retry.
    #[error("Storage error: {0}")]
    Storage(StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ServerError::NotFound,
            StoreError::Forbidden(msg) => ServerError::Forbidden(msg),
            StoreError::Validation(msg) => ServerError::Validation(msg),
            other => ServerError::Storage(other),
        }
    }
}

impl ServerError {
    /// Short machine-readable code, used by the live transport's error
    /// events so clients can dispatch without string matching.
    pub fn code(&self) -> &'static str {
        match self {
            ServerError::Validation(_) => "validation",
            ServerError::Forbidden(_) => "forbidden",
            ServerError::NotFound => "not_found",
            ServerError::Unauthorized(_) => "unauthorized",
            ServerError::FileTooLarge { .. } => "file_too_large",
            ServerError::Storage(_) => "storage",
            ServerError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::FileTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, self.to_string())
            }
            ServerError::Storage(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error".to_string())
            }
            ServerError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
            "code": self.code(),
        });

        (status, axum::Json(body)).into_response()
    }
}
