//! Communication event stream.
//!
//! The bus, its error handler and the router report everything that happens
//! asynchronously through [`CommunicationEvent`]s. Logging, metrics and
//! conversation persistence attach here instead of being called directly.
//!
//! Each component is given an [`EventDispatcher`], an instance-scoped observer
//! registry. Cloning a dispatcher shares the same listener set, which is how
//! the router and error handler end up on the same stream as the bus.
//!
//! # Event Flow (failing subscriber, `max_retries = 2`)
//!
//! ```text
//! conversation-updated { id: "c1", current_phase: "request" }
//! communication-error  { type: "delivery-failed" }        (attempt 1)
//! communication-error  { type: "delivery-failed" }        (attempt 2)
//! message-moved-to-dlq { id }
//! message-retry-failed { message_id, retry_count: 2 }
//! ```
//!
//! # Example
//!
//! ```rust
//! use agentmesh::event::{CommunicationEvent, EventDispatcher, EventFilter, EventHandler, EventKind};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct DlqAlarm;
//!
//! #[async_trait]
//! impl EventHandler for DlqAlarm {
//!     async fn on_event(&self, event: &CommunicationEvent) {
//!         log::warn!("{}: {:?}", event.name(), event);
//!     }
//! }
//!
//! let events = EventDispatcher::new();
//! let handle = events.subscribe(EventFilter::kinds([EventKind::MessageMovedToDlq]), Arc::new(DlqAlarm));
//! assert!(events.unsubscribe(&handle));
//! ```

use crate::agentmesh::error::ErrorKind;
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Events emitted by the communication core.
#[derive(Debug, Clone, PartialEq)]
pub enum CommunicationEvent {
    /// `agent-subscribed`
    AgentSubscribed {
        agent_role: String,
        subscription_id: String,
    },
    /// `agent-unsubscribed`
    AgentUnsubscribed {
        agent_role: String,
        subscription_id: String,
    },
    /// `message-delivered`: a subscriber callback returned `Ok`.
    MessageDelivered {
        message_id: String,
        agent_role: String,
        attempts: u32,
    },
    /// `message-retry-failed`: a subscription exhausted its retries.
    MessageRetryFailed {
        message_id: String,
        agent_role: String,
        retry_count: u32,
        error: String,
    },
    /// `conversation-updated`
    ConversationUpdated {
        id: String,
        current_phase: String,
        message_count: usize,
    },
    /// `communication-error`: one failed delivery attempt or a routing error.
    CommunicationError {
        error_type: ErrorKind,
        message: String,
        message_id: Option<String>,
    },
    /// `message-routed`: the router picked a final recipient.
    MessageRouted {
        message_id: String,
        original_recipient: String,
        recipient: String,
        rule_id: Option<String>,
    },
    /// `circuit-breaker-opened`
    CircuitBreakerOpened { agent_type: String, failure_count: u32 },
    /// `circuit-breaker-half-open`
    CircuitBreakerHalfOpen { agent_type: String },
    /// `circuit-breaker-closed`
    CircuitBreakerClosed { agent_type: String },
    /// `message-moved-to-dlq`
    MessageMovedToDlq { id: String },
}

/// Tag of a [`CommunicationEvent`] variant, used for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AgentSubscribed,
    AgentUnsubscribed,
    MessageDelivered,
    MessageRetryFailed,
    ConversationUpdated,
    CommunicationError,
    MessageRouted,
    CircuitBreakerOpened,
    CircuitBreakerHalfOpen,
    CircuitBreakerClosed,
    MessageMovedToDlq,
}

impl CommunicationEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CommunicationEvent::AgentSubscribed { .. } => EventKind::AgentSubscribed,
            CommunicationEvent::AgentUnsubscribed { .. } => EventKind::AgentUnsubscribed,
            CommunicationEvent::MessageDelivered { .. } => EventKind::MessageDelivered,
            CommunicationEvent::MessageRetryFailed { .. } => EventKind::MessageRetryFailed,
            CommunicationEvent::ConversationUpdated { .. } => EventKind::ConversationUpdated,
            CommunicationEvent::CommunicationError { .. } => EventKind::CommunicationError,
            CommunicationEvent::MessageRouted { .. } => EventKind::MessageRouted,
            CommunicationEvent::CircuitBreakerOpened { .. } => EventKind::CircuitBreakerOpened,
            CommunicationEvent::CircuitBreakerHalfOpen { .. } => EventKind::CircuitBreakerHalfOpen,
            CommunicationEvent::CircuitBreakerClosed { .. } => EventKind::CircuitBreakerClosed,
            CommunicationEvent::MessageMovedToDlq { .. } => EventKind::MessageMovedToDlq,
        }
    }

    /// Kebab-case event name, e.g. `"message-moved-to-dlq"`.
    pub fn name(&self) -> &'static str {
        self.kind().name()
    }
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::AgentSubscribed => "agent-subscribed",
            EventKind::AgentUnsubscribed => "agent-unsubscribed",
            EventKind::MessageDelivered => "message-delivered",
            EventKind::MessageRetryFailed => "message-retry-failed",
            EventKind::ConversationUpdated => "conversation-updated",
            EventKind::CommunicationError => "communication-error",
            EventKind::MessageRouted => "message-routed",
            EventKind::CircuitBreakerOpened => "circuit-breaker-opened",
            EventKind::CircuitBreakerHalfOpen => "circuit-breaker-half-open",
            EventKind::CircuitBreakerClosed => "circuit-breaker-closed",
            EventKind::MessageMovedToDlq => "message-moved-to-dlq",
        }
    }
}

/// Receiver of [`CommunicationEvent`]s.
///
/// The default implementation is a no-op. Handlers are invoked inline on the
/// emitting task, so keep them short and hand heavy work off to a channel.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, _event: &CommunicationEvent) {}
}

/// Which events a listener wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Kinds(HashSet<EventKind>),
}

impl EventFilter {
    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        EventFilter::Kinds(kinds.into_iter().collect())
    }

    fn accepts(&self, kind: EventKind) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Kinds(kinds) => kinds.contains(&kind),
        }
    }
}

/// Disposable registration returned by [`EventDispatcher::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    id: String,
}

impl ListenerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }
}

struct Listener {
    id: String,
    filter: EventFilter,
    handler: Arc<dyn EventHandler>,
}

/// Instance-scoped observer registry.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, filter: EventFilter, handler: Arc<dyn EventHandler>) -> ListenerHandle {
        let id = Uuid::new_v4().to_string();
        let mut listeners = self.listeners.write().unwrap_or_else(|p| p.into_inner());
        listeners.push(Listener {
            id: id.clone(),
            filter,
            handler,
        });
        ListenerHandle { id }
    }

    /// Returns `false` if the handle was already removed.
    pub fn unsubscribe(&self, handle: &ListenerHandle) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|p| p.into_inner());
        let before = listeners.len();
        listeners.retain(|l| l.id != handle.id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Deliver `event` to every listener whose filter accepts it.
    ///
    /// The listener set is snapshotted before any handler runs and no lock is
    /// held across an `.await`. Listeners run concurrently; each one sees
    /// events in emit order.
    pub async fn emit(&self, event: CommunicationEvent) {
        let kind = event.kind();
        let targets: Vec<Arc<dyn EventHandler>> = {
            let listeners = self.listeners.read().unwrap_or_else(|p| p.into_inner());
            listeners
                .iter()
                .filter(|l| l.filter.accepts(kind))
                .map(|l| Arc::clone(&l.handler))
                .collect()
        };
        join_all(targets.iter().map(|handler| handler.on_event(&event))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn on_event(&self, event: &CommunicationEvent) {
            self.seen.lock().await.push(event.name());
        }
    }

    #[tokio::test]
    async fn filtered_listener_only_sees_selected_kinds() {
        let events = EventDispatcher::new();
        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        events.subscribe(
            EventFilter::kinds([EventKind::MessageMovedToDlq]),
            recorder.clone(),
        );

        events
            .emit(CommunicationEvent::AgentSubscribed {
                agent_role: "research".into(),
                subscription_id: "s1".into(),
            })
            .await;
        events
            .emit(CommunicationEvent::MessageMovedToDlq { id: "m1".into() })
            .await;

        assert_eq!(*recorder.seen.lock().await, vec!["message-moved-to-dlq"]);
    }

    #[tokio::test]
    async fn unsubscribed_listener_receives_nothing() {
        let events = EventDispatcher::new();
        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        let handle = events.subscribe(EventFilter::All, recorder.clone());
        assert!(events.unsubscribe(&handle));
        assert!(!events.unsubscribe(&handle));

        events
            .emit(CommunicationEvent::CircuitBreakerClosed { agent_type: "x".into() })
            .await;
        assert!(recorder.seen.lock().await.is_empty());
        assert_eq!(events.listener_count(), 0);
    }

    #[tokio::test]
    async fn every_listener_receives_each_event() {
        let events = EventDispatcher::new();
        let first = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        let second = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        events.subscribe(EventFilter::All, first.clone());
        events.subscribe(EventFilter::All, second.clone());

        events
            .emit(CommunicationEvent::CircuitBreakerHalfOpen { agent_type: "x".into() })
            .await;

        assert_eq!(*first.seen.lock().await, vec!["circuit-breaker-half-open"]);
        assert_eq!(*second.seen.lock().await, vec!["circuit-breaker-half-open"]);
    }
}
