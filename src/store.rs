//! Conversation persistence boundary.
//!
//! The router writes exactly one thing: the assistant reply of a successful call.
//! It reads exactly one thing: which provider answered the previous reply in a
//! conversation, to apply the recency penalty.

use crate::error::Error;
use crate::types::chunk::{FinishReason, Usage};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub id: String,
    pub conversation_id: String,
    pub provider_id: String,
    pub content: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
    pub latency_ms: u64,
    pub created_at_ms: u64,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a reply. Returns the stored message id.
    async fn save_assistant_message(&self, message: AssistantMessage) -> Result<String>;

    /// Provider of the most recent assistant reply in the conversation.
    async fn last_assistant_provider(&self, conversation_id: &str) -> Result<Option<String>>;
}

/// Keeps replies per conversation in memory.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    conversations: RwLock<HashMap<String, Vec<AssistantMessage>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<AssistantMessage> {
        self.conversations
            .read()
            .map(|c| c.get(conversation_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn save_assistant_message(&self, message: AssistantMessage) -> Result<String> {
        let id = message.id.clone();
        self.conversations
            .write()
            .map_err(|_| Error::poisoned("message_store"))?
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
        Ok(id)
    }

    async fn last_assistant_provider(&self, conversation_id: &str) -> Result<Option<String>> {
        let conversations = self
            .conversations
            .read()
            .map_err(|_| Error::poisoned("message_store"))?;
        Ok(conversations
            .get(conversation_id)
            .and_then(|m| m.last())
            .map(|m| m.provider_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(conversation: &str, provider: &str) -> AssistantMessage {
        AssistantMessage {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation.into(),
            provider_id: provider.into(),
            content: "hi".into(),
            usage: Usage::default(),
            finish_reason: FinishReason::Stop,
            latency_ms: 1,
            created_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_last_provider_tracks_latest_reply() {
        let store = InMemoryMessageStore::new();
        assert_eq!(store.last_assistant_provider("c").await.unwrap(), None);
        store.save_assistant_message(reply("c", "a")).await.unwrap();
        store.save_assistant_message(reply("c", "b")).await.unwrap();
        store.save_assistant_message(reply("other", "z")).await.unwrap();
        assert_eq!(
            store.last_assistant_provider("c").await.unwrap().as_deref(),
            Some("b")
        );
        assert_eq!(store.messages("c").len(), 2);
    }
}
