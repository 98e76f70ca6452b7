//! Message persistence contract and in-memory store.
//!
//! The relay calls [`MessageStore::save_message`] exactly once per session
//! on every exit path past opening, whatever way the stream ended.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use moechat_core::message::{ChatTurn, MessageRole, MessageStatus, StoredMessage};

use crate::error::RelayResult;

/// Message repository boundary.
///
/// Implementations must accept concurrent calls from many sessions; every
/// call is parameterized by `chat_id`, so there is no cross-session state.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist one message, returning its store-assigned id.
    async fn save_message(
        &self,
        chat_id: Uuid,
        role: MessageRole,
        content: &str,
        status: MessageStatus,
        model_id: Option<&str>,
        position: u32,
    ) -> RelayResult<Uuid>;

    /// 1-based position the next message in the chat should take.
    async fn next_position(&self, chat_id: Uuid) -> RelayResult<u32>;

    /// Most recent turns, oldest first, for upstream request context.
    /// Messages with status `error` or `pending` are excluded.
    async fn recent_turns(&self, chat_id: Uuid, limit: usize) -> RelayResult<Vec<ChatTurn>>;
}

/// Store backed by a per-chat vector. Used in tests and standalone runs;
/// production deployments wire a database-backed implementation here.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    chats: RwLock<HashMap<Uuid, Vec<StoredMessage>>>,
}

impl InMemoryMessageStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages of one chat, in insertion order.
    pub fn messages(&self, chat_id: Uuid) -> Vec<StoredMessage> {
        self.chats.read().get(&chat_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn save_message(
        &self,
        chat_id: Uuid,
        role: MessageRole,
        content: &str,
        status: MessageStatus,
        model_id: Option<&str>,
        position: u32,
    ) -> RelayResult<Uuid> {
        let message = StoredMessage {
            id: Uuid::new_v4(),
            chat_id,
            role,
            content: content.to_string(),
            status,
            model_id: model_id.map(str::to_string),
            position,
            created_at: Utc::now(),
        };
        let id = message.id;
        self.chats.write().entry(chat_id).or_default().push(message);
        Ok(id)
    }

    async fn next_position(&self, chat_id: Uuid) -> RelayResult<u32> {
        let count = self
            .chats
            .read()
            .get(&chat_id)
            .map_or(0, |messages| messages.len() as u32);
        Ok(count + 1)
    }

    async fn recent_turns(&self, chat_id: Uuid, limit: usize) -> RelayResult<Vec<ChatTurn>> {
        let chats = self.chats.read();
        let Some(messages) = chats.get(&chat_id) else {
            return Ok(Vec::new());
        };
        let turns: Vec<ChatTurn> = messages
            .iter()
            .filter(|m| m.status == MessageStatus::Completed)
            .map(|m| ChatTurn {
                role: m.role,
                content: m.content.clone(),
            })
            .collect();
        let skip = turns.len().saturating_sub(limit);
        Ok(turns.into_iter().skip(skip).collect())
    }
}
