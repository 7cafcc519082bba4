//! In-process message bus.
//!
//! The bus admits a message, records it in its conversation, then fans it out
//! to every matching subscription on its own tokio task. A failing or slow
//! subscriber never blocks the caller or the other subscribers.
//!
//! # Delivery
//!
//! ```text
//! send_message(msg)
//!   ├─ admission: pending < max_queue_size, else Err(QueueFull)
//!   ├─ conversation append  → conversation-updated
//!   └─ for each matching subscription (tokio::spawn)
//!        attempt 1..=max_retries
//!          ├─ Ok   → message-delivered
//!          └─ Err  → error handler decides: sleep(delay) and retry,
//!                    or dead-letter → message-retry-failed
//! ```
//!
//! Each subscription is attempted at most `max_retries` times. When the
//! next retry would start after `message_timeout_ms` the remaining retries are
//! abandoned; an in-flight callback is never cancelled.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::bus::MessageBus;
//! use agentmesh::config::MessageBusConfig;
//! use agentmesh::message::{AgentMessage, MessageTypePattern};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = MessageBus::new(MessageBusConfig::default());
//!
//! bus.subscribe_fn("research", vec![MessageTypePattern::exact("request")], |msg| async move {
//!     log::info!("research got {}", msg.content);
//!     Ok(())
//! })
//! .await;
//!
//! let msg = AgentMessage::new("supervisor", "research", "request", json!({"task": "scan"}))
//!     .in_conversation("c1");
//! let receipt = bus.send_message(msg).await.unwrap();
//! assert_eq!(receipt.deliveries, 1);
//!
//! bus.wait_idle().await;
//! assert_eq!(bus.get_conversation_history("c1").await.len(), 1);
//! # }
//! ```

use crate::agentmesh::config::{CommunicationConfig, ErrorHandlerConfig, MessageBusConfig};
use crate::agentmesh::conversation::{
    ConversationContext, ConversationPersistence, ConversationStore, NoopPersistence,
};
use crate::agentmesh::error::{CommunicationError, HandlerError};
use crate::agentmesh::error_handler::{CommunicationErrorHandler, ErrorStats};
use crate::agentmesh::event::{CommunicationEvent, EventDispatcher};
use crate::agentmesh::message::{AgentMessage, MessageTypePattern, Recipient};
use crate::agentmesh::subscription::{
    FnHandler, MessageHandler, Subscription, SubscriptionHandle, SubscriptionRegistry,
};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Proof of admission returned by [`MessageBus::send_message`].
#[derive(Debug, Clone, PartialEq)]
pub struct MessageReceipt {
    pub message_id: String,
    /// Effective recipient of the delivered message.
    pub recipient: Recipient,
    /// Number of subscriptions the message was fanned out to.
    pub deliveries: usize,
}

/// Admitted messages whose deliveries have not all finished.
#[derive(Clone, Default)]
struct PendingTracker {
    count: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl PendingTracker {
    fn try_admit(&self, max: usize) -> bool {
        self.count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n >= max {
                    None
                } else {
                    Some(n + 1)
                }
            })
            .is_ok()
    }

    fn release(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

/// Everything a spawned delivery task needs.
#[derive(Clone)]
struct DeliveryContext {
    events: EventDispatcher,
    error_handler: Arc<CommunicationErrorHandler>,
    pending: PendingTracker,
    timeout: Duration,
}

pub struct MessageBus {
    config: MessageBusConfig,
    registry: SubscriptionRegistry,
    conversations: ConversationStore,
    events: EventDispatcher,
    error_handler: Arc<CommunicationErrorHandler>,
    persistence: Arc<dyn ConversationPersistence>,
    pending: PendingTracker,
}

impl MessageBus {
    /// Create a bus whose retries use the fixed `retry_delay_ms` policy.
    pub fn new(config: MessageBusConfig) -> Self {
        let events = EventDispatcher::new();
        let error_handler = Arc::new(
            CommunicationErrorHandler::new(ErrorHandlerConfig::fixed_from_bus(&config))
                .with_events(events.clone()),
        );
        Self {
            config,
            registry: SubscriptionRegistry::new(),
            conversations: ConversationStore::new(),
            events,
            error_handler,
            persistence: Arc::new(NoopPersistence),
            pending: PendingTracker::default(),
        }
    }

    /// Build a bus from an aggregate options record, with the backoff policy
    /// from `config.error_handler` attached.
    pub fn from_config(config: &CommunicationConfig) -> Result<Self, CommunicationError> {
        config.validate()?;
        Ok(Self::new(config.bus.clone()).with_error_config(config.error_handler.clone()))
    }

    /// Layer a backoff/dead-letter policy on top of the bus (builder pattern).
    ///
    /// The handler shares this bus's event stream. The bus's `max_retries`
    /// replaces the one in `config`, so attempts per subscription are always
    /// what [`config`](Self::config) reports.
    pub fn with_error_config(mut self, config: ErrorHandlerConfig) -> Self {
        if config.max_retries != self.config.max_retries {
            log::debug!(
                "error handler max_retries {} overridden by bus max_retries {}",
                config.max_retries,
                self.config.max_retries
            );
        }
        let config = ErrorHandlerConfig {
            max_retries: self.config.max_retries,
            ..config
        };
        self.error_handler = Arc::new(
            CommunicationErrorHandler::new(config).with_events(self.events.clone()),
        );
        self
    }

    /// Use a handler built elsewhere, e.g. with a seeded jitter source.
    ///
    /// Build it with `.with_events(bus.events().clone())` to keep its events
    /// on the bus stream. The handler's own `max_retries` is used as is.
    pub fn with_error_handler(mut self, handler: Arc<CommunicationErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    /// Sink for appended messages, used when `enable_persistence` is set.
    /// Defaults to [`NoopPersistence`].
    pub fn with_persistence(mut self, persistence: Arc<dyn ConversationPersistence>) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn config(&self) -> &MessageBusConfig {
        &self.config
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    pub fn error_handler(&self) -> &Arc<CommunicationErrorHandler> {
        &self.error_handler
    }

    pub async fn subscribe(
        &self,
        agent_role: impl Into<String>,
        patterns: Vec<MessageTypePattern>,
        handler: Arc<dyn MessageHandler>,
    ) -> SubscriptionHandle {
        let handle = self.registry.add(agent_role, patterns, handler).await;
        log::debug!("agent '{}' subscribed ({})", handle.agent_role, handle.id);
        self.events
            .emit(CommunicationEvent::AgentSubscribed {
                agent_role: handle.agent_role.clone(),
                subscription_id: handle.id.clone(),
            })
            .await;
        handle
    }

    /// Subscribe an async closure.
    pub async fn subscribe_fn<F, Fut>(
        &self,
        agent_role: impl Into<String>,
        patterns: Vec<MessageTypePattern>,
        function: F,
    ) -> SubscriptionHandle
    where
        F: Fn(AgentMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.subscribe(agent_role, patterns, Arc::new(FnHandler::new(function)))
            .await
    }

    /// Returns `false` if the handle was already removed.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let removed = self.registry.remove(handle).await;
        if removed {
            log::debug!("agent '{}' unsubscribed ({})", handle.agent_role, handle.id);
            self.events
                .emit(CommunicationEvent::AgentUnsubscribed {
                    agent_role: handle.agent_role.clone(),
                    subscription_id: handle.id.clone(),
                })
                .await;
        }
        removed
    }

    pub async fn subscribed_roles(&self) -> Vec<String> {
        self.registry.roles().await
    }

    pub async fn is_subscribed(&self, agent_role: &str) -> bool {
        self.registry.is_subscribed(agent_role).await
    }

    /// Admit `message` and start asynchronous delivery.
    ///
    /// Only admission can fail. Delivery failures are reported through
    /// events and the error handler.
    pub async fn send_message(&self, message: AgentMessage) -> Result<MessageReceipt, CommunicationError> {
        if !self.pending.try_admit(self.config.max_queue_size) {
            log::warn!(
                "rejecting message {}: {} messages pending",
                message.id,
                self.config.max_queue_size
            );
            return Err(CommunicationError::QueueFull {
                max_queue_size: self.config.max_queue_size,
            });
        }
        let admitted = Instant::now();

        let subscriptions = self.registry.resolve(&message).await;
        let receipt = MessageReceipt {
            message_id: message.id.clone(),
            recipient: message.recipient.clone(),
            deliveries: subscriptions.len(),
        };

        self.record_in_conversation(&message).await;

        if subscriptions.is_empty() {
            log::debug!("message {} to '{}' has no subscribers", message.id, message.recipient);
            self.pending.release();
            return Ok(receipt);
        }

        let remaining = Arc::new(AtomicUsize::new(subscriptions.len()));
        let context = DeliveryContext {
            events: self.events.clone(),
            error_handler: Arc::clone(&self.error_handler),
            pending: self.pending.clone(),
            timeout: self.config.message_timeout(),
        };
        for subscription in subscriptions {
            let context = context.clone();
            let remaining = Arc::clone(&remaining);
            let message = message.clone();
            tokio::spawn(async move {
                deliver(&context, subscription, message, admitted).await;
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    context.pending.release();
                }
            });
        }

        Ok(receipt)
    }

    async fn record_in_conversation(&self, message: &AgentMessage) {
        let update = self.conversations.append(message.clone()).await;
        self.events
            .emit(CommunicationEvent::ConversationUpdated {
                id: update.conversation_id,
                current_phase: update.current_phase,
                message_count: update.message_count,
            })
            .await;

        if !self.config.enable_persistence {
            return;
        }
        let persistence = Arc::clone(&self.persistence);
        let message = message.clone();
        tokio::spawn(async move {
            if let Err(e) = persistence.persist(&message).await {
                log::warn!("failed to persist message {}: {}", message.id, e);
            }
        });
    }

    pub async fn get_conversation_history(&self, conversation_id: &str) -> Vec<AgentMessage> {
        self.conversations.history(conversation_id).await
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> Option<ConversationContext> {
        self.conversations.get(conversation_id).await
    }

    pub async fn conversation_ids(&self) -> Vec<String> {
        self.conversations.conversation_ids().await
    }

    pub async fn get_error_stats(&self) -> ErrorStats {
        self.error_handler.get_error_stats().await
    }

    /// Admitted messages with deliveries still running.
    pub fn pending_count(&self) -> usize {
        self.pending.current()
    }

    /// Wait until every admitted message has finished delivery.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.pending.idle.notified();
            if self.pending.current() == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn deliver(
    context: &DeliveryContext,
    subscription: Subscription,
    message: AgentMessage,
    admitted: Instant,
) {
    let role = subscription.agent_role.as_str();
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let error = match subscription.handler.handle(message.clone()).await {
            Ok(()) => {
                context
                    .events
                    .emit(CommunicationEvent::MessageDelivered {
                        message_id: message.id.clone(),
                        agent_role: role.to_string(),
                        attempts: attempt,
                    })
                    .await;
                return;
            }
            Err(e) => CommunicationError::DeliveryFailed(e.to_string()),
        };

        let decision = context
            .error_handler
            .handle_failure(&message, role, &error, attempt)
            .await;

        let final_error = if !decision.should_retry {
            error
        } else {
            let elapsed = admitted.elapsed();
            if elapsed + decision.delay < context.timeout {
                tokio::time::sleep(decision.delay).await;
                continue;
            }
            let timeout = CommunicationError::Timeout {
                elapsed_ms: elapsed.as_millis() as u64,
            };
            context
                .error_handler
                .abandon(&message, role, &timeout, attempt)
                .await;
            timeout
        };

        context
            .events
            .emit(CommunicationEvent::MessageRetryFailed {
                message_id: message.id.clone(),
                agent_role: role.to_string(),
                retry_count: attempt,
                error: final_error.to_string(),
            })
            .await;
        return;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fast_config() -> MessageBusConfig {
        MessageBusConfig {
            retry_delay_ms: 1,
            ..MessageBusConfig::default()
        }
    }

    #[tokio::test]
    async fn message_without_subscribers_is_still_recorded() {
        let bus = MessageBus::new(fast_config());
        let msg = AgentMessage::new("supervisor", "nobody", "request", json!({})).in_conversation("c9");
        let receipt = bus.send_message(msg.clone()).await.unwrap();
        assert_eq!(receipt.deliveries, 0);
        assert_eq!(bus.pending_count(), 0);
        assert_eq!(bus.get_conversation_history("c9").await, vec![msg]);
    }

    #[tokio::test]
    async fn full_queue_rejects_admission() {
        let bus = MessageBus::new(MessageBusConfig {
            max_queue_size: 1,
            ..fast_config()
        });
        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);
        bus.subscribe_fn("slow", vec![MessageTypePattern::Any], move |_msg| {
            let release = Arc::clone(&release);
            async move {
                release.notified().await;
                Ok(())
            }
        })
        .await;

        bus.send_message(AgentMessage::new("a", "slow", "request", json!({})))
            .await
            .unwrap();
        let err = bus
            .send_message(AgentMessage::new("a", "slow", "request", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err, CommunicationError::QueueFull { max_queue_size: 1 });

        while bus.pending_count() > 0 {
            gate.notify_waiters();
            tokio::task::yield_now().await;
        }
        bus.wait_idle().await;
        assert!(bus
            .send_message(AgentMessage::new("a", "slow", "update", json!({})))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = MessageBus::new(fast_config());
        let handle = bus
            .subscribe_fn("research", vec![MessageTypePattern::Any], |_msg| async { Ok(()) })
            .await;
        assert!(bus.is_subscribed("research").await);
        assert!(bus.unsubscribe(&handle).await);
        let receipt = bus
            .send_message(AgentMessage::new("a", "research", "request", json!({})))
            .await
            .unwrap();
        assert_eq!(receipt.deliveries, 0);
        assert!(bus.subscribed_roles().await.is_empty());
    }

    #[test]
    fn error_config_keeps_bus_max_retries() {
        let bus = MessageBus::new(MessageBusConfig {
            max_retries: 5,
            ..fast_config()
        })
        .with_error_config(ErrorHandlerConfig::default());
        assert_eq!(bus.error_handler().config().max_retries, 5);
        assert!(bus.error_handler().config().exponential_backoff);
    }

    #[test]
    fn from_config_applies_bus_and_error_handler_sections() {
        let config = CommunicationConfig::from_json_str(
            r#"{
                "bus": { "max_retries": 2, "max_queue_size": 8 },
                "error_handler": { "base_retry_delay_ms": 10, "max_retry_delay_ms": 40, "jitter_enabled": false }
            }"#,
        )
        .unwrap();
        let bus = MessageBus::from_config(&config).unwrap();
        assert_eq!(bus.config().max_queue_size, 8);

        let policy = bus.error_handler().config();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.base_retry_delay_ms, 10);
        assert_eq!(bus.error_handler().compute_retry_delay(3), Duration::from_millis(40));
    }

    #[test]
    fn from_config_rejects_invalid_record() {
        let config = CommunicationConfig {
            bus: MessageBusConfig {
                max_queue_size: 0,
                ..MessageBusConfig::default()
            },
            ..CommunicationConfig::default()
        };
        assert!(matches!(
            MessageBus::from_config(&config),
            Err(CommunicationError::InvalidConfig(_))
        ));
    }
}
