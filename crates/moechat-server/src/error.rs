//! Relay error taxonomy and HTTP mapping.
//!
//! Only pre-stream failures become HTTP error responses. Once SSE headers
//! are committed, failures surface as an error-shaped terminal frame inside
//! the stream instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use moechat_llm::UpstreamError;
use serde_json::json;

/// Result type alias for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Failures surfaced by the relay.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Requested model is not in the directory.
    #[error("model not found: {model_id}")]
    ModelNotFound {
        /// The requested id.
        model_id: String,
    },

    /// Model is known but inactive (failed its last health probe).
    #[error("model unavailable: {model_id}")]
    ModelUnavailable {
        /// The requested id.
        model_id: String,
    },

    /// Upstream call failed.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Persistence sink rejected a write.
    #[error("persistence error: {message}")]
    Persistence {
        /// What the store reported.
        message: String,
    },
}

impl RelayError {
    /// HTTP status for the pre-stream error response.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ModelNotFound { .. } => StatusCode::NOT_FOUND,
            Self::ModelUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Persistence { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wire `error.type` string.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::ModelNotFound { .. } => "model_not_found",
            Self::ModelUnavailable { .. } => "model_unavailable",
            Self::Upstream(_) => "upstream_error",
            Self::Persistence { .. } => "persistence_error",
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": status.as_u16(),
            }
        });
        (status, Json(body)).into_response()
    }
}
