//! Options records for the bus, router and error handler.
//!
//! Users construct these directly or parse a JSON options record with
//! [`CommunicationConfig::from_json_str`]. Every field has a default, so a
//! partial record only overrides what it names.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::config::{CommunicationConfig, LoadBalancingStrategyKind};
//!
//! let config = CommunicationConfig::from_json_str(r#"{
//!     "bus": { "max_retries": 5 },
//!     "router": { "load_balancing_strategy": "round-robin" }
//! }"#).unwrap();
//!
//! assert_eq!(config.bus.max_retries, 5);
//! assert_eq!(config.bus.max_queue_size, 1000);
//! assert_eq!(config.router.load_balancing_strategy, LoadBalancingStrategyKind::RoundRobin);
//! ```

use crate::agentmesh::error::CommunicationError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Options for [`MessageBus`](crate::bus::MessageBus).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageBusConfig {
    /// Delivery attempts per subscription before the message is dead-lettered.
    ///
    /// Takes precedence over `ErrorHandlerConfig::max_retries` when a policy
    /// is attached with [`MessageBus::with_error_config`](crate::bus::MessageBus::with_error_config).
    pub max_retries: u32,
    /// Fixed delay between attempts when the bus builds its own error handler.
    pub retry_delay_ms: u64,
    /// Age after which remaining retries are abandoned.
    pub message_timeout_ms: u64,
    /// Admitted-but-undelivered messages allowed before `send_message` rejects.
    pub max_queue_size: usize,
    /// Forward every appended message to the attached
    /// [`ConversationPersistence`](crate::conversation::ConversationPersistence).
    pub enable_persistence: bool,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            message_timeout_ms: 30_000,
            max_queue_size: 1000,
            enable_persistence: false,
        }
    }
}

impl MessageBusConfig {
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }
}

/// Candidate selection strategy for the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategyKind {
    /// Fewest current tasks, ties broken by highest reliability.
    LeastBusy,
    /// Rotate through candidates in name order.
    RoundRobin,
    /// Lowest average processing time, ties broken by highest reliability.
    FastestResponse,
}

/// Options for [`MessageRouter`](crate::router::MessageRouter).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub enable_load_balancing: bool,
    pub load_balancing_strategy: LoadBalancingStrategyKind,
    pub enable_circuit_breaker: bool,
    /// Delivery failures that open an agent's breaker.
    pub circuit_breaker_threshold: u32,
    pub enable_message_transformation: bool,
    pub max_routing_hops: u32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enable_load_balancing: true,
            load_balancing_strategy: LoadBalancingStrategyKind::LeastBusy,
            enable_circuit_breaker: true,
            circuit_breaker_threshold: 5,
            enable_message_transformation: false,
            max_routing_hops: 10,
        }
    }
}

/// Options for [`CommunicationErrorHandler`](crate::error_handler::CommunicationErrorHandler).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorHandlerConfig {
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub exponential_backoff: bool,
    pub jitter_enabled: bool,
    pub dead_letter_queue_enabled: bool,
    pub error_reporting_enabled: bool,
    /// Whether delivery failures feed router circuit breakers.
    pub circuit_breaker_enabled: bool,
}

impl Default for ErrorHandlerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_retry_delay_ms: 1000,
            max_retry_delay_ms: 30_000,
            exponential_backoff: true,
            jitter_enabled: true,
            dead_letter_queue_enabled: true,
            error_reporting_enabled: true,
            circuit_breaker_enabled: true,
        }
    }
}

impl ErrorHandlerConfig {
    /// Fixed-delay policy equivalent to a bare bus config.
    pub fn fixed_from_bus(bus: &MessageBusConfig) -> Self {
        Self {
            max_retries: bus.max_retries,
            base_retry_delay_ms: bus.retry_delay_ms,
            max_retry_delay_ms: bus.retry_delay_ms,
            exponential_backoff: false,
            jitter_enabled: false,
            ..Self::default()
        }
    }
}

/// All options in one record.
///
/// [`MessageBus::from_config`](crate::bus::MessageBus::from_config) applies
/// `bus` and `error_handler`; pass `router` to
/// [`MessageRouter::new`](crate::router::MessageRouter::new).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunicationConfig {
    pub bus: MessageBusConfig,
    pub router: RouterConfig,
    pub error_handler: ErrorHandlerConfig,
}

impl CommunicationConfig {
    /// Parse and validate a JSON options record.
    pub fn from_json_str(json: &str) -> Result<Self, CommunicationError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| CommunicationError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CommunicationError> {
        if self.bus.max_queue_size == 0 {
            return Err(CommunicationError::InvalidConfig(
                "bus.max_queue_size must be greater than 0".into(),
            ));
        }
        if self.router.max_routing_hops == 0 {
            return Err(CommunicationError::InvalidConfig(
                "router.max_routing_hops must be greater than 0".into(),
            ));
        }
        if self.router.circuit_breaker_threshold == 0 {
            return Err(CommunicationError::InvalidConfig(
                "router.circuit_breaker_threshold must be greater than 0".into(),
            ));
        }
        if self.error_handler.max_retry_delay_ms < self.error_handler.base_retry_delay_ms {
            return Err(CommunicationError::InvalidConfig(format!(
                "error_handler.max_retry_delay_ms ({}) is below base_retry_delay_ms ({})",
                self.error_handler.max_retry_delay_ms, self.error_handler.base_retry_delay_ms
            )));
        }
        Ok(())
    }
}
