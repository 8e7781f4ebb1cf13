use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy for the vault core. Every variant maps to exactly one
/// user-visible HTTP status; handlers return `VaultError` and let
/// `IntoResponse` do the mapping.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Malformed request body or invalid alias.
    #[error("{0}")]
    InvalidInput(String),

    /// Missing or bad signature, missing or bad admin token.
    #[error("{0}")]
    Unauthenticated(String),

    /// Unknown alias.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate register.
    #[error("{0}")]
    AlreadyExists(String),

    /// Quota exceeded for the current window.
    #[error("Rate limit exceeded")]
    RateLimited { retry_after_ms: i64 },

    /// Upstream dispatch error, timeout, or non-response.
    #[error("{0}")]
    Upstream(String),

    /// Decrypt auth-tag mismatch. Surfaced generically; specifics stay in
    /// the server log.
    #[error("credential integrity check failed")]
    Integrity,

    /// Storage I/O failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl IntoResponse for VaultError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::InvalidInput(_) => (StatusCode::BAD_REQUEST, json!({"error": self.to_string()})),
            Self::Unauthenticated(_) => {
                (StatusCode::UNAUTHORIZED, json!({"error": self.to_string()}))
            }
            Self::NotFound(_) => (StatusCode::NOT_FOUND, json!({"error": self.to_string()})),
            Self::AlreadyExists(_) => (StatusCode::CONFLICT, json!({"error": self.to_string()})),
            Self::RateLimited { retry_after_ms } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "error": "Rate limit exceeded",
                    "remaining": 0,
                    "retry_after_ms": retry_after_ms,
                }),
            ),
            Self::Upstream(_) => (StatusCode::BAD_GATEWAY, json!({"error": self.to_string()})),
            Self::Integrity => {
                tracing::error!(error = %self, "integrity failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": "Internal server error"}),
                )
            }
            Self::Backend(_) => {
                tracing::error!(error = %self, "backend failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": "Internal server error"}),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}
