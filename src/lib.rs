//! # AgentMesh
//!
//! AgentMesh is the in-process communication core for a team of cooperating agents. Agents
//! subscribe to a shared bus, exchange typed messages grouped into conversations, and rely
//! on the crate for delivery retries, routing and failure bookkeeping.
//!
//! The crate provides carefully layered abstractions for:
//!
//! * **Message Bus**: [`MessageBus`] keeps the subscription registry and conversation
//!   history, and fans every message out to matching subscribers on independent tokio tasks
//! * **Message Router**: [`MessageRouter`] applies priority-ordered [`RoutingRule`]s,
//!   load-balances across capable agents and skips agents whose circuit breaker is open
//! * **Error Handling**: [`CommunicationErrorHandler`] owns the backoff policy, the
//!   dead-letter queue and the aggregate [`ErrorStats`]
//! * **Events**: every asynchronous outcome is published on an [`EventDispatcher`] so that
//!   logging, metrics or persistence can attach without the core calling them directly
//!
//! Nothing here is process-global. Build a bus, optionally wrap it in a router, and hand both
//! to your agents.
//!
//! ## Quick Start
//!
//! ```rust
//! use agentmesh::{AgentMessage, MessageBus, MessageBusConfig, MessageTypePattern};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! agentmesh::init_logger();
//!
//! let bus = MessageBus::new(MessageBusConfig::default());
//! bus.subscribe_fn("research", vec![MessageTypePattern::Any], |msg| async move {
//!     log::info!("research received {}", msg.message_type);
//!     Ok(())
//! })
//! .await;
//!
//! let request = AgentMessage::new("supervisor", "research", "request", json!({"task": "scan"}))
//!     .in_conversation("c1");
//! bus.send_message(request).await.unwrap();
//!
//! bus.wait_idle().await;
//! assert_eq!(bus.get_conversation_history("c1").await.len(), 1);
//! # }
//! ```
//!
//! ## Retries and the Dead-Letter Queue
//!
//! A subscriber that returns `Err` is retried up to `max_retries` attempts in total. By
//! default the bus waits a fixed `retry_delay_ms` between attempts; attach an
//! [`ErrorHandlerConfig`] for exponential backoff with jitter:
//!
//! ```rust
//! use agentmesh::{ErrorHandlerConfig, MessageBus, MessageBusConfig};
//!
//! let bus = MessageBus::new(MessageBusConfig::default()).with_error_config(ErrorHandlerConfig {
//!     base_retry_delay_ms: 200,
//!     max_retry_delay_ms: 5_000,
//!     ..ErrorHandlerConfig::default()
//! });
//! assert!(bus.error_handler().config().exponential_backoff);
//! ```
//!
//! Messages that exhaust their attempts land in the dead-letter queue and are counted by
//! [`MessageBus::get_error_stats`].
//!
//! ## Observing Events
//!
//! ```rust
//! use agentmesh::{CommunicationEvent, EventFilter, EventHandler, EventKind, MessageBus, MessageBusConfig};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct DeadLetterLogger;
//!
//! #[async_trait]
//! impl EventHandler for DeadLetterLogger {
//!     async fn on_event(&self, event: &CommunicationEvent) {
//!         log::error!("{}: {:?}", event.name(), event);
//!     }
//! }
//!
//! let bus = MessageBus::new(MessageBusConfig::default());
//! bus.events().subscribe(
//!     EventFilter::kinds([EventKind::MessageMovedToDlq, EventKind::CircuitBreakerOpened]),
//!     Arc::new(DeadLetterLogger),
//! );
//! ```

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// Library code only logs through the `log` facade; call this from binaries or tests to get
/// `RUST_LOG` driven output.
///
/// ```rust
/// agentmesh::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

// Import the top-level `agentmesh` module.
pub mod agentmesh;

// Re-exporting key items for easier external access.
pub use agentmesh::bus;
pub use agentmesh::bus::{MessageBus, MessageReceipt};
pub use agentmesh::circuit_breaker;
pub use agentmesh::circuit_breaker::{
    BreakerTransition, CircuitBreakerState, CircuitState, CooldownRecovery, ManualRecovery,
    RecoveryPolicy,
};
pub use agentmesh::config;
pub use agentmesh::config::{
    CommunicationConfig, ErrorHandlerConfig, LoadBalancingStrategyKind, MessageBusConfig,
    RouterConfig,
};
pub use agentmesh::conversation;
pub use agentmesh::conversation::{ConversationContext, ConversationPersistence, NoopPersistence};
pub use agentmesh::error;
pub use agentmesh::error::{CommunicationError, ErrorKind, HandlerError};
pub use agentmesh::error_handler;
pub use agentmesh::error_handler::{
    CommunicationErrorHandler, DeadLetterEntry, ErrorStats, FixedJitter, JitterSource,
    RetryDecision, SeededJitter,
};
pub use agentmesh::event;
pub use agentmesh::event::{
    CommunicationEvent, EventDispatcher, EventFilter, EventHandler, EventKind, ListenerHandle,
};
pub use agentmesh::load_balancer;
pub use agentmesh::message;
pub use agentmesh::message::{AgentMessage, MessagePriority, MessageTypePattern, Recipient};
pub use agentmesh::router;
pub use agentmesh::router::{MessageRouter, MessageTransformer};
pub use agentmesh::rules;
pub use agentmesh::rules::{RoutingAction, RoutingRule};
pub use agentmesh::status;
pub use agentmesh::status::{AgentCapabilities, AgentState, AgentStatus};
pub use agentmesh::subscription;
pub use agentmesh::subscription::{FnHandler, MessageHandler, SubscriptionHandle};
