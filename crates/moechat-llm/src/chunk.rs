//! Upstream `chat.completion.chunk` wire types and decoding.

use serde::{Deserialize, Serialize};

/// Why the upstream stream ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// Natural end of generation.
    Stop,
    /// Token limit reached.
    Length,
    /// Upstream reported a generation failure.
    Error,
    /// Any other reason string; treated like `Stop` for relay purposes.
    #[serde(other)]
    Other,
}

impl FinishReason {
    /// Wire string for client-facing frames.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop | Self::Other => "stop",
            Self::Length => "length",
            Self::Error => "error",
        }
    }
}

/// Incremental delta within one chunk choice.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDelta {
    /// Set once at stream start (`"assistant"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// New text, possibly empty. A delta with neither role nor content is a
    /// well-formed no-op.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// One choice within a streaming chunk. The relay only ever reads index 0.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkChoice {
    /// Choice index.
    #[serde(default)]
    pub index: u32,
    /// The incremental delta.
    #[serde(default)]
    pub delta: ChunkDelta,
    /// Terminal marker; `None` for every chunk except the last.
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

/// One decoded `chat.completion.chunk` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    /// Upstream completion id.
    pub id: String,
    /// Always `"chat.completion.chunk"`.
    #[serde(default)]
    pub object: String,
    /// Unix timestamp assigned upstream.
    #[serde(default)]
    pub created: i64,
    /// Model that produced the chunk.
    #[serde(default)]
    pub model: String,
    /// Choices; empty is tolerated as a no-op.
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    /// MoE routing metadata, present only for instrumented backends. Held
    /// as raw JSON just long enough for the extractor to inspect it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expert_info: Option<serde_json::Value>,
}

impl ChatCompletionChunk {
    /// New content text carried by this chunk, if any.
    pub fn content_delta(&self) -> Option<&str> {
        self.choices.first()?.delta.content.as_deref()
    }

    /// Finish reason, if this is the terminal chunk.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.choices.first()?.finish_reason
    }

    /// Whether this chunk ends the stream.
    pub fn is_terminal(&self) -> bool {
        self.finish_reason().is_some()
    }
}

/// A payload that could not be decoded as a chunk.
///
/// Logged and skipped by the relay; three in a row escalate to a protocol
/// failure.
#[derive(Clone, Debug, thiserror::Error)]
#[error("malformed chunk: {message} (payload: {preview})")]
pub struct MalformedChunk {
    /// Decode error description.
    pub message: String,
    /// Truncated payload text for logs.
    pub preview: String,
}

/// One item of a decoded upstream chunk stream.
#[derive(Clone, Debug)]
pub enum ChunkEvent {
    /// A decoded chunk.
    Chunk(ChatCompletionChunk),
    /// An undecodable payload; the session counts and skips it.
    Malformed(MalformedChunk),
    /// The `[DONE]` sentinel.
    Done,
}

/// Decode one SSE data payload into a chunk.
pub fn parse_chunk(data: &str) -> Result<ChatCompletionChunk, MalformedChunk> {
    serde_json::from_str(data).map_err(|e| MalformedChunk {
        message: e.to_string(),
        preview: preview_of(data),
    })
}

fn preview_of(data: &str) -> String {
    const MAX: usize = 120;
    if data.len() <= MAX {
        data.to_string()
    } else {
        let mut end = MAX;
        while !data.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &data[..end])
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Non-streaming completion shape
// ─────────────────────────────────────────────────────────────────────────────

/// Assistant message within a non-streaming completion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletionMessage {
    /// Always `"assistant"`.
    #[serde(default)]
    pub role: String,
    /// Answer text. May embed the thinking marker for backends that do not
    /// split reasoning out themselves.
    #[serde(default)]
    pub content: String,
    /// Reasoning text, when the backend separates it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
}

/// One choice of a non-streaming completion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompletionChoice {
    /// Choice index.
    #[serde(default)]
    pub index: u32,
    /// The completed message.
    pub message: CompletionMessage,
    /// Why generation stopped.
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

/// Token accounting from a non-streaming completion.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Tokens in the prompt.
    #[serde(default)]
    pub prompt_tokens: u32,
    /// Tokens generated.
    #[serde(default)]
    pub completion_tokens: u32,
    /// Sum of the above.
    #[serde(default)]
    pub total_tokens: u32,
}

/// A complete non-streaming `chat.completion` response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatCompletion {
    /// Upstream completion id.
    pub id: String,
    /// Always `"chat.completion"`.
    #[serde(default)]
    pub object: String,
    /// Model that answered.
    #[serde(default)]
    pub model: String,
    /// Choices; the relay reads index 0.
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
    /// Token accounting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// MoE routing metadata, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expert_info: Option<serde_json::Value>,
}

impl ChatCompletion {
    /// Answer text of the first choice, or empty.
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map_or("", |c| c.message.content.as_str())
    }

    /// Separated reasoning text of the first choice, if the backend provides
    /// it.
    pub fn reasoning_content(&self) -> Option<&str> {
        self.choices.first()?.message.reasoning_content.as_deref()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
