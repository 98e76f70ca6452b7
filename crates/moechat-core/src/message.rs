//! Message roles, statuses, and the persisted message shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Who authored a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System prompt.
    System,
    /// End user.
    User,
    /// Model output.
    Assistant,
}

impl MessageRole {
    /// Wire string for OpenAI-shaped requests (`"system" | "user" | "assistant"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Persistence status of a message.
///
/// Assistant messages are written once at end of stream: `Completed` when the
/// upstream finished normally, `Error` when the session aborted or the model
/// reported a generation failure. `Pending` exists for stores that reserve a
/// row before streaming begins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Reserved, content not final.
    Pending,
    /// Stream finished normally.
    Completed,
    /// Stream aborted or upstream reported failure; content may be partial.
    Error,
}

/// A message as handed to (or read back from) the persistence sink.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Store-assigned message id.
    pub id: Uuid,
    /// Conversation this message belongs to.
    pub chat_id: Uuid,
    /// Author role.
    pub role: MessageRole,
    /// Message text. For assistant messages this is answer text only —
    /// thinking text never reaches the store through the relay.
    pub content: String,
    /// Final status.
    pub status: MessageStatus,
    /// Model that produced the message (assistant messages only).
    pub model_id: Option<String>,
    /// 1-based position within the chat.
    pub position: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// One `(role, content)` turn of conversation context for an upstream
/// chat-completions request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    /// Author role.
    pub role: MessageRole,
    /// Turn text.
    pub content: String,
}

impl ChatTurn {
    /// Build a user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Build an assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }

    /// Build a system turn.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}
