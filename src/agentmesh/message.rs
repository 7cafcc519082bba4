//! Typed messages exchanged between agents.
//!
//! An [`AgentMessage`] is addressed either to a single agent role or to every
//! subscriber via [`Recipient::Broadcast`]. Messages are treated as immutable
//! once built: a reply is a *new* message created with [`AgentMessage::reply`]
//! that keeps the original `conversation_id` and `request_id`.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::message::{AgentMessage, MessagePriority, Recipient};
//! use serde_json::json;
//!
//! let request = AgentMessage::new("supervisor", "research", "request", json!({"task": "market-scan"}))
//!     .with_priority(MessagePriority::High)
//!     .in_conversation("c1");
//!
//! assert_eq!(request.recipient, Recipient::agent("research"));
//! assert_eq!(request.metadata.conversation_id, "c1");
//!
//! let response = request.reply("research", "response", json!({"findings": 3}));
//! assert_eq!(response.recipient, Recipient::agent("supervisor"));
//! assert_eq!(response.metadata.conversation_id, "c1");
//! assert_eq!(response.metadata.request_id, request.metadata.request_id);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Wire value of the broadcast recipient.
pub const BROADCAST: &str = "broadcast";

/// Destination of a message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Recipient {
    /// A single agent role, e.g. `"research"`.
    Agent(String),
    /// Every current subscriber.
    Broadcast,
}

impl Recipient {
    /// Address a single agent role.
    pub fn agent(role: impl Into<String>) -> Self {
        Recipient::Agent(role.into())
    }

    /// Role name, or `None` for broadcast.
    pub fn role(&self) -> Option<&str> {
        match self {
            Recipient::Agent(role) => Some(role),
            Recipient::Broadcast => None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Recipient::Broadcast)
    }
}

impl From<String> for Recipient {
    fn from(value: String) -> Self {
        if value == BROADCAST {
            Recipient::Broadcast
        } else {
            Recipient::Agent(value)
        }
    }
}

impl From<&str> for Recipient {
    fn from(value: &str) -> Self {
        Recipient::from(value.to_string())
    }
}

impl From<Recipient> for String {
    fn from(value: Recipient) -> Self {
        match value {
            Recipient::Agent(role) => role,
            Recipient::Broadcast => BROADCAST.to_string(),
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recipient::Agent(role) => write!(f, "{}", role),
            Recipient::Broadcast => write!(f, "{}", BROADCAST),
        }
    }
}

/// Delivery priority carried in message metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    Medium,
    High,
}

impl Default for MessagePriority {
    fn default() -> Self {
        MessagePriority::Medium
    }
}

/// Bookkeeping attached to every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub priority: MessagePriority,
    pub timestamp: DateTime<Utc>,
    /// Groups messages into a conversation history.
    pub conversation_id: String,
    /// Shared by a request and all of its replies.
    pub request_id: String,
    /// Number of times the message has passed through a router.
    #[serde(default)]
    pub routing_hops: u32,
    /// Recipient before any router override, recorded when message
    /// transformation is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_recipient: Option<Recipient>,
}

/// A typed request, response or notification between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Unique id assigned at construction.
    pub id: String,
    /// Sending agent role or external caller id.
    pub sender: String,
    pub recipient: Recipient,
    /// Open-ended type such as `request`, `response`, `update` or `alert`.
    pub message_type: String,
    /// Role-specific payload.
    pub content: Value,
    pub metadata: MessageMetadata,
}

impl AgentMessage {
    /// Build a message in a fresh conversation with `Medium` priority.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<Recipient>,
        message_type: impl Into<String>,
        content: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            recipient: recipient.into(),
            message_type: message_type.into(),
            content,
            metadata: MessageMetadata {
                priority: MessagePriority::default(),
                timestamp: Utc::now(),
                conversation_id: Uuid::new_v4().to_string(),
                request_id: Uuid::new_v4().to_string(),
                routing_hops: 0,
                original_recipient: None,
            },
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.metadata.priority = priority;
        self
    }

    /// Place the message in an existing conversation.
    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.metadata.conversation_id = conversation_id.into();
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.metadata.request_id = request_id.into();
        self
    }

    /// Build a reply addressed to this message's sender.
    ///
    /// The reply gets its own id and timestamp but keeps the conversation,
    /// request id and priority of the original.
    pub fn reply(&self, sender: impl Into<String>, message_type: impl Into<String>, content: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            recipient: Recipient::agent(self.sender.clone()),
            message_type: message_type.into(),
            content,
            metadata: MessageMetadata {
                priority: self.metadata.priority,
                timestamp: Utc::now(),
                conversation_id: self.metadata.conversation_id.clone(),
                request_id: self.metadata.request_id.clone(),
                routing_hops: 0,
                original_recipient: None,
            },
        }
    }

    /// Task name the message asks for, read from `content.task` or
    /// `content.taskType`.
    pub fn implied_task(&self) -> Option<&str> {
        self.content
            .get("task")
            .or_else(|| self.content.get("taskType"))
            .and_then(Value::as_str)
    }
}

/// Message-type filter used by subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageTypePattern {
    /// Matches every message type.
    Any,
    /// Matches one message type exactly.
    Exact(String),
}

impl MessageTypePattern {
    pub fn exact(message_type: impl Into<String>) -> Self {
        MessageTypePattern::Exact(message_type.into())
    }

    pub fn matches(&self, message_type: &str) -> bool {
        match self {
            MessageTypePattern::Any => true,
            MessageTypePattern::Exact(expected) => expected == message_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn broadcast_recipient_round_trips_through_strings() {
        assert_eq!(Recipient::from("broadcast"), Recipient::Broadcast);
        assert_eq!(Recipient::from("analysis"), Recipient::agent("analysis"));
        assert_eq!(String::from(Recipient::Broadcast), "broadcast");
    }

    #[test]
    fn message_serializes_recipient_as_plain_string() {
        let msg = AgentMessage::new("planner", Recipient::Broadcast, "update", json!({}));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["recipient"], "broadcast");
        assert_eq!(value["metadata"]["priority"], "medium");

        let back: AgentMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn implied_task_prefers_task_over_task_type() {
        let msg = AgentMessage::new("a", "b", "request", json!({"task": "scan", "taskType": "other"}));
        assert_eq!(msg.implied_task(), Some("scan"));

        let msg = AgentMessage::new("a", "b", "request", json!({"taskType": "audit"}));
        assert_eq!(msg.implied_task(), Some("audit"));

        let msg = AgentMessage::new("a", "b", "request", json!({"task": 7}));
        assert_eq!(msg.implied_task(), None);
    }

    #[test]
    fn pattern_matching() {
        assert!(MessageTypePattern::Any.matches("alert"));
        assert!(MessageTypePattern::exact("alert").matches("alert"));
        assert!(!MessageTypePattern::exact("alert").matches("request"));
    }
}
