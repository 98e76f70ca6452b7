//! Upstream error taxonomy.

/// Result type alias for upstream operations.
pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Errors from the upstream inference backend.
///
/// `Disconnected` and `Protocol` are mid-stream failures that abort a relay
/// session; `Api`, `Http`, and `Timeout` can also occur before any SSE bytes
/// have been written to the client, in which case they surface as a plain
/// HTTP error response instead.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// HTTP transport failure (connect, TLS, request build).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON decode failure on a non-streaming response body.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Upstream returned a non-success status with an error body.
    #[error("upstream API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error description from the upstream body, or the raw body text.
        message: String,
    },

    /// No chunk arrived within the per-chunk idle window.
    #[error("upstream timed out after {elapsed_secs}s without a chunk")]
    Timeout {
        /// Seconds waited before giving up.
        elapsed_secs: u64,
    },

    /// Connection dropped before a terminal chunk was received.
    #[error("upstream disconnected mid-stream")]
    Disconnected,

    /// Upstream stopped speaking the chunk protocol (for example, three
    /// consecutive undecodable payloads).
    #[error("upstream protocol error: {message}")]
    Protocol {
        /// What went wrong.
        message: String,
    },
}

impl UpstreamError {
    /// Whether this error occurred mid-stream (after SSE headers may have
    /// been committed to the client).
    pub fn is_mid_stream(&self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::Protocol { .. } | Self::Timeout { .. }
        )
    }

    /// Category label for logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Http(_) => "network",
            Self::Json(_) => "parse",
            Self::Api { .. } => "api",
            Self::Timeout { .. } => "timeout",
            Self::Disconnected => "disconnect",
            Self::Protocol { .. } => "protocol",
        }
    }
}
