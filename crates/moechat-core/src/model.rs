//! Model directory record.

use serde::{Deserialize, Serialize};

/// Marker separating reasoning from answer text for models that emit a
/// thinking preamble. Used when a model record does not override it.
pub const DEFAULT_THINKING_MARKER: &str = "</think>";

/// One entry in the model directory.
///
/// The directory itself is an external collaborator refreshed out-of-band
/// (heartbeat probes); relay sessions read a record once at open and never
/// re-check it mid-stream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Model identifier as requested by clients and sent upstream.
    pub id: String,
    /// Human-readable name.
    pub display_name: String,
    /// Whether the backing service answered its last health probe.
    pub is_active: bool,
    /// Base URL of the OpenAI-compatible service hosting this model.
    pub service_url: String,
    /// Whether the model emits a thinking preamble before its answer.
    pub has_thinking: bool,
    /// Marker terminating the thinking preamble. `None` falls back to
    /// [`DEFAULT_THINKING_MARKER`]. Ignored when `has_thinking` is false.
    pub thinking_marker: Option<String>,
    /// Context window size in tokens.
    pub max_context_tokens: u32,
}

impl ModelRecord {
    /// Create a record with defaults suitable for a freshly discovered model.
    pub fn new(id: impl Into<String>, service_url: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            is_active: true,
            service_url: service_url.into(),
            has_thinking: false,
            thinking_marker: None,
            max_context_tokens: 4096,
        }
    }

    /// Enable thinking with the default marker.
    pub fn with_thinking(mut self) -> Self {
        self.has_thinking = true;
        self
    }

    /// The marker the splitter should scan for, or `None` when the model has
    /// no thinking capability (scanning is bypassed entirely).
    pub fn splitter_marker(&self) -> Option<&str> {
        if !self.has_thinking {
            return None;
        }
        Some(
            self.thinking_marker
                .as_deref()
                .unwrap_or(DEFAULT_THINKING_MARKER),
        )
    }
}
