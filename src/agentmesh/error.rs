//! Error types shared by the bus, router and error handler.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// Coarse classification of a [`CommunicationError`].
///
/// Used as the key of [`ErrorStats::errors_by_type`](crate::error_handler::ErrorStats).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    QueueFull,
    DuplicateRule,
    TargetUnavailable,
    NoCapableAgent,
    HopLimitExceeded,
    DeliveryFailed,
    Timeout,
    InvalidConfig,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::QueueFull => "queue-full",
            ErrorKind::DuplicateRule => "duplicate-rule",
            ErrorKind::TargetUnavailable => "target-unavailable",
            ErrorKind::NoCapableAgent => "no-capable-agent",
            ErrorKind::HopLimitExceeded => "hop-limit-exceeded",
            ErrorKind::DeliveryFailed => "delivery-failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidConfig => "invalid-config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by admission, routing and delivery.
///
/// Admission and routing errors are returned synchronously from
/// [`MessageBus::send_message`](crate::bus::MessageBus::send_message) and
/// [`MessageRouter::route_message`](crate::router::MessageRouter::route_message).
/// Delivery errors are only observed through events and the dead-letter queue.
///
/// # Examples
///
/// ```
/// use agentmesh::error::{CommunicationError, ErrorKind};
///
/// let err = CommunicationError::QueueFull { max_queue_size: 10 };
/// assert_eq!(err.to_string(), "Message queue full (max 10 pending)");
/// assert_eq!(err.kind(), ErrorKind::QueueFull);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum CommunicationError {
    /// The bus already holds `max_queue_size` undelivered messages.
    QueueFull { max_queue_size: usize },
    /// A routing rule with the same id is already registered.
    DuplicateRule(String),
    /// The target's circuit breaker is open and no substitute was found.
    TargetUnavailable(String),
    /// No registered agent can handle the requested task.
    NoCapableAgent(String),
    /// The message has been routed more times than allowed.
    HopLimitExceeded { hops: u32, max_hops: u32 },
    /// A subscriber callback failed.
    DeliveryFailed(String),
    /// The message stayed undelivered past the configured timeout.
    Timeout { elapsed_ms: u64 },
    InvalidConfig(String),
}

impl CommunicationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommunicationError::QueueFull { .. } => ErrorKind::QueueFull,
            CommunicationError::DuplicateRule(_) => ErrorKind::DuplicateRule,
            CommunicationError::TargetUnavailable(_) => ErrorKind::TargetUnavailable,
            CommunicationError::NoCapableAgent(_) => ErrorKind::NoCapableAgent,
            CommunicationError::HopLimitExceeded { .. } => ErrorKind::HopLimitExceeded,
            CommunicationError::DeliveryFailed(_) => ErrorKind::DeliveryFailed,
            CommunicationError::Timeout { .. } => ErrorKind::Timeout,
            CommunicationError::InvalidConfig(_) => ErrorKind::InvalidConfig,
        }
    }
}

impl fmt::Display for CommunicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommunicationError::QueueFull { max_queue_size } => {
                write!(f, "Message queue full (max {} pending)", max_queue_size)
            }
            CommunicationError::DuplicateRule(id) => {
                write!(f, "Routing rule already exists: {}", id)
            }
            CommunicationError::TargetUnavailable(role) => {
                write!(f, "Target unavailable: {}", role)
            }
            CommunicationError::NoCapableAgent(task) => {
                write!(f, "No capable agent for task: {}", task)
            }
            CommunicationError::HopLimitExceeded { hops, max_hops } => {
                write!(f, "Routing hop limit exceeded ({} > {})", hops, max_hops)
            }
            CommunicationError::DeliveryFailed(msg) => write!(f, "Delivery failed: {}", msg),
            CommunicationError::Timeout { elapsed_ms } => {
                write!(f, "Message timed out after {}ms", elapsed_ms)
            }
            CommunicationError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl Error for CommunicationError {}

/// Error type returned by subscriber callbacks.
pub type HandlerError = Box<dyn Error + Send + Sync>;
