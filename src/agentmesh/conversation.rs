//! Append-only per-conversation message history.
//!
//! The store keeps one lock for the id → context map and one lock per
//! conversation, so appends to unrelated conversations never contend on the
//! same guard.

use crate::agentmesh::error::HandlerError;
use crate::agentmesh::message::AgentMessage;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Ordered history of one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationContext {
    pub conversation_id: String,
    pub messages: Vec<AgentMessage>,
    /// Message type of the most recently appended message.
    pub current_phase: String,
    /// Every sender seen in the conversation.
    pub participants: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationContext {
    fn new(conversation_id: String) -> Self {
        let now = Utc::now();
        Self {
            conversation_id,
            messages: Vec::new(),
            current_phase: String::new(),
            participants: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn append(&mut self, message: AgentMessage) {
        self.current_phase = message.message_type.clone();
        self.participants.insert(message.sender.clone());
        self.updated_at = Utc::now();
        self.messages.push(message);
    }
}

/// Snapshot returned after an append.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationUpdate {
    pub conversation_id: String,
    pub current_phase: String,
    pub message_count: usize,
}

/// Conversation history keyed by conversation id.
#[derive(Default)]
pub struct ConversationStore {
    conversations: RwLock<HashMap<String, Arc<Mutex<ConversationContext>>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `message` to its conversation, creating the context on first use.
    pub async fn append(&self, message: AgentMessage) -> ConversationUpdate {
        let context = self.context_for(&message.metadata.conversation_id).await;
        let mut context = context.lock().await;
        context.append(message);
        ConversationUpdate {
            conversation_id: context.conversation_id.clone(),
            current_phase: context.current_phase.clone(),
            message_count: context.messages.len(),
        }
    }

    async fn context_for(&self, conversation_id: &str) -> Arc<Mutex<ConversationContext>> {
        if let Some(existing) = self.conversations.read().await.get(conversation_id) {
            return Arc::clone(existing);
        }
        let mut conversations = self.conversations.write().await;
        Arc::clone(
            conversations
                .entry(conversation_id.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(ConversationContext::new(conversation_id.to_string())))
                }),
        )
    }

    /// Messages of a conversation in append order; empty when unknown.
    pub async fn history(&self, conversation_id: &str) -> Vec<AgentMessage> {
        match self.get(conversation_id).await {
            Some(context) => context.messages,
            None => Vec::new(),
        }
    }

    /// Full snapshot of a conversation.
    pub async fn get(&self, conversation_id: &str) -> Option<ConversationContext> {
        let context = self.conversations.read().await.get(conversation_id).cloned()?;
        let snapshot = context.lock().await.clone();
        Some(snapshot)
    }

    pub async fn conversation_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.conversations.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// External sink for conversation messages.
///
/// Storage is owned by the caller; the bus only forwards appended messages
/// when `enable_persistence` is set.
#[async_trait]
pub trait ConversationPersistence: Send + Sync {
    async fn persist(&self, _message: &AgentMessage) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Persistence sink that discards everything.
pub struct NoopPersistence;

impl ConversationPersistence for NoopPersistence {}
