//! Agent role → subscription registry.
//!
//! Subscribers implement [`MessageHandler`] or register an async closure
//! through [`FnHandler`]. A role may hold several subscriptions and every one
//! whose pattern matches receives the message.

use crate::agentmesh::error::HandlerError;
use crate::agentmesh::message::{AgentMessage, MessageTypePattern, Recipient};
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Callback invoked for each delivered message.
///
/// Returning `Err` triggers the retry policy.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: AgentMessage) -> Result<(), HandlerError>;
}

/// Type alias for async closures accepted by [`FnHandler`].
pub type AsyncMessageFn = Arc<
    dyn Fn(AgentMessage) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>
        + Send
        + Sync,
>;

/// Adapter turning an async closure into a [`MessageHandler`].
pub struct FnHandler {
    function: AsyncMessageFn,
}

impl FnHandler {
    pub fn new<F, Fut>(function: F) -> Self
    where
        F: Fn(AgentMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self {
            function: Arc::new(move |message| Box::pin(function(message))),
        }
    }
}

#[async_trait]
impl MessageHandler for FnHandler {
    async fn handle(&self, message: AgentMessage) -> Result<(), HandlerError> {
        (self.function)(message).await
    }
}

/// One registration of a handler for a role.
#[derive(Clone)]
pub struct Subscription {
    pub id: String,
    pub agent_role: String,
    pub patterns: Vec<MessageTypePattern>,
    pub handler: Arc<dyn MessageHandler>,
}

impl Subscription {
    pub fn matches(&self, message_type: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(message_type))
    }
}

/// Token returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: String,
    pub agent_role: String,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    by_role: RwLock<HashMap<String, Vec<Subscription>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(
        &self,
        agent_role: impl Into<String>,
        patterns: Vec<MessageTypePattern>,
        handler: Arc<dyn MessageHandler>,
    ) -> SubscriptionHandle {
        let agent_role = agent_role.into();
        let subscription = Subscription {
            id: Uuid::new_v4().to_string(),
            agent_role: agent_role.clone(),
            patterns,
            handler,
        };
        let handle = SubscriptionHandle {
            id: subscription.id.clone(),
            agent_role: agent_role.clone(),
        };
        self.by_role
            .write()
            .await
            .entry(agent_role)
            .or_default()
            .push(subscription);
        handle
    }

    /// Returns `false` if the handle was not registered.
    pub async fn remove(&self, handle: &SubscriptionHandle) -> bool {
        let mut by_role = self.by_role.write().await;
        let Some(subscriptions) = by_role.get_mut(&handle.agent_role) else {
            return false;
        };
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != handle.id);
        let removed = subscriptions.len() != before;
        if subscriptions.is_empty() {
            by_role.remove(&handle.agent_role);
        }
        removed
    }

    /// Subscriptions that should receive `message`.
    ///
    /// Broadcast reaches every subscription of every role; a direct message
    /// reaches the recipient's subscriptions whose pattern matches its type.
    pub async fn resolve(&self, message: &AgentMessage) -> Vec<Subscription> {
        let by_role = self.by_role.read().await;
        match &message.recipient {
            Recipient::Broadcast => by_role.values().flatten().cloned().collect(),
            Recipient::Agent(role) => by_role
                .get(role)
                .map(|subs| {
                    subs.iter()
                        .filter(|s| s.matches(&message.message_type))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub async fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.by_role.read().await.keys().cloned().collect();
        roles.sort();
        roles
    }

    pub async fn is_subscribed(&self, agent_role: &str) -> bool {
        self.by_role.read().await.contains_key(agent_role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop() -> Arc<dyn MessageHandler> {
        Arc::new(FnHandler::new(|_msg| async { Ok(()) }))
    }

    #[tokio::test]
    async fn direct_messages_respect_type_patterns() {
        let registry = SubscriptionRegistry::new();
        registry
            .add("research", vec![MessageTypePattern::exact("request")], noop())
            .await;
        registry.add("research", vec![MessageTypePattern::Any], noop()).await;
        registry.add("analysis", vec![MessageTypePattern::Any], noop()).await;

        let request = AgentMessage::new("supervisor", "research", "request", json!({}));
        assert_eq!(registry.resolve(&request).await.len(), 2);

        let alert = AgentMessage::new("supervisor", "research", "alert", json!({}));
        assert_eq!(registry.resolve(&alert).await.len(), 1);

        let unknown = AgentMessage::new("supervisor", "compliance", "request", json!({}));
        assert!(registry.resolve(&unknown).await.is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_role() {
        let registry = SubscriptionRegistry::new();
        registry.add("research", vec![MessageTypePattern::exact("request")], noop()).await;
        registry.add("analysis", vec![MessageTypePattern::Any], noop()).await;

        let msg = AgentMessage::new("supervisor", Recipient::Broadcast, "update", json!({}));
        let mut roles: Vec<String> = registry
            .resolve(&msg)
            .await
            .into_iter()
            .map(|s| s.agent_role)
            .collect();
        roles.sort();
        assert_eq!(roles, vec!["analysis", "research"]);
    }

    #[tokio::test]
    async fn removing_last_subscription_drops_role() {
        let registry = SubscriptionRegistry::new();
        let handle = registry.add("planning", vec![MessageTypePattern::Any], noop()).await;
        assert!(registry.is_subscribed("planning").await);
        assert!(registry.remove(&handle).await);
        assert!(!registry.remove(&handle).await);
        assert!(!registry.is_subscribed("planning").await);
    }
}
