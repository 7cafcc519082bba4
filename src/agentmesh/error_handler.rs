//! Retry policy, dead-letter queue and error statistics.
//!
//! [`CommunicationErrorHandler`] is a pure decision and bookkeeping component:
//! the bus reports every failed delivery attempt, the handler answers whether
//! to retry and after how long, and records terminal failures. It never
//! returns an error itself.
//!
//! # Backoff
//!
//! With `exponential_backoff` the pre-jitter delay for a 0-based retry index
//! `n` is `min(base_retry_delay_ms * 2^n, max_retry_delay_ms)`:
//!
//! ```rust
//! use agentmesh::config::ErrorHandlerConfig;
//! use agentmesh::error_handler::CommunicationErrorHandler;
//! use std::time::Duration;
//!
//! let handler = CommunicationErrorHandler::new(ErrorHandlerConfig {
//!     jitter_enabled: false,
//!     ..ErrorHandlerConfig::default()
//! });
//!
//! let delays: Vec<u64> = (0..6)
//!     .map(|n| handler.compute_retry_delay(n).as_millis() as u64)
//!     .collect();
//! assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000]);
//! ```
//!
//! # Jitter
//!
//! With `jitter_enabled` the delay is multiplied by a factor drawn uniformly
//! from `[0.5, 1.5]` and clamped to `max_retry_delay_ms`. The factor comes from
//! a [`JitterSource`]; use [`SeededJitter::seeded`] or [`FixedJitter`] for
//! deterministic tests.

use crate::agentmesh::config::ErrorHandlerConfig;
use crate::agentmesh::error::{CommunicationError, ErrorKind};
use crate::agentmesh::event::{CommunicationEvent, EventDispatcher};
use crate::agentmesh::message::AgentMessage;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;

/// Source of the jitter multiplier applied to retry delays.
pub trait JitterSource: Send + Sync {
    /// A factor in `[0.5, 1.5]`.
    fn factor(&self) -> f64;
}

/// Uniform jitter backed by a [`StdRng`].
pub struct SeededJitter {
    rng: StdMutex<StdRng>,
}

impl SeededJitter {
    pub fn from_entropy() -> Self {
        Self {
            rng: StdMutex::new(StdRng::from_entropy()),
        }
    }

    /// Reproducible sequence for tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdMutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl JitterSource for SeededJitter {
    fn factor(&self) -> f64 {
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        rng.gen_range(0.5..=1.5)
    }
}

/// Constant jitter factor.
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn factor(&self) -> f64 {
        self.0.clamp(0.5, 1.5)
    }
}

/// Answer to [`CommunicationErrorHandler::handle_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    /// Wait before the next attempt; zero when not retrying.
    pub delay: Duration,
}

/// A message that exhausted its delivery attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterEntry {
    pub message: AgentMessage,
    /// Role whose subscription failed.
    pub agent_role: String,
    pub error: String,
    pub error_type: ErrorKind,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate view over recorded failures.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorStats {
    /// Terminal delivery failures since start.
    pub total_errors: usize,
    pub errors_by_type: HashMap<ErrorKind, usize>,
    pub dead_letter_queue_size: usize,
    /// Every failed attempt, retried or not.
    pub failed_attempts: usize,
    pub errors_by_agent: HashMap<String, usize>,
}

#[derive(Default)]
struct ErrorState {
    total_errors: usize,
    failed_attempts: usize,
    errors_by_type: HashMap<ErrorKind, usize>,
    errors_by_agent: HashMap<String, usize>,
    dead_letters: Vec<DeadLetterEntry>,
}

pub struct CommunicationErrorHandler {
    config: ErrorHandlerConfig,
    events: EventDispatcher,
    jitter: Arc<dyn JitterSource>,
    state: Mutex<ErrorState>,
}

impl CommunicationErrorHandler {
    pub fn new(config: ErrorHandlerConfig) -> Self {
        Self {
            config,
            events: EventDispatcher::new(),
            jitter: Arc::new(SeededJitter::from_entropy()),
            state: Mutex::new(ErrorState::default()),
        }
    }

    /// Emit events on a shared dispatcher (builder pattern).
    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn config(&self) -> &ErrorHandlerConfig {
        &self.config
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    pub fn circuit_breaker_enabled(&self) -> bool {
        self.config.circuit_breaker_enabled
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn compute_retry_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_retry_delay_ms;
        let max = self.config.max_retry_delay_ms;
        let mut delay_ms = if self.config.exponential_backoff {
            let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
            base.saturating_mul(factor).min(max)
        } else {
            base.min(max)
        };
        if self.config.jitter_enabled {
            let jittered = (delay_ms as f64 * self.jitter.factor()).round() as u64;
            delay_ms = jittered.min(max);
        }
        Duration::from_millis(delay_ms)
    }

    /// Record a failed attempt and decide whether to retry.
    ///
    /// `attempt` is the number of attempts made so far (1 after the first
    /// failure). Once it reaches `max_retries` the failure is terminal and the
    /// message is dead-lettered.
    pub async fn handle_failure(
        &self,
        message: &AgentMessage,
        agent_role: &str,
        error: &CommunicationError,
        attempt: u32,
    ) -> RetryDecision {
        let attempt = attempt.max(1);
        self.state.lock().await.failed_attempts += 1;

        log::warn!(
            "delivery of message {} to '{}' failed (attempt {}/{}): {}",
            message.id,
            agent_role,
            attempt,
            self.config.max_retries,
            error
        );
        self.report(message, error).await;

        if attempt < self.config.max_retries {
            return RetryDecision {
                should_retry: true,
                delay: self.compute_retry_delay(attempt - 1),
            };
        }

        self.record_terminal(message, agent_role, error, attempt).await;
        RetryDecision {
            should_retry: false,
            delay: Duration::ZERO,
        }
    }

    /// Give up on a message whose retries are still available, e.g. because
    /// the next attempt would land past its timeout.
    ///
    /// `attempts` is the number of attempts already recorded through
    /// [`handle_failure`](Self::handle_failure); no further attempt is counted.
    pub async fn abandon(
        &self,
        message: &AgentMessage,
        agent_role: &str,
        error: &CommunicationError,
        attempts: u32,
    ) {
        log::warn!(
            "abandoning message {} to '{}' after {} attempt(s): {}",
            message.id,
            agent_role,
            attempts,
            error
        );
        self.report(message, error).await;
        self.record_terminal(message, agent_role, error, attempts).await;
    }

    async fn report(&self, message: &AgentMessage, error: &CommunicationError) {
        if self.config.error_reporting_enabled {
            self.events
                .emit(CommunicationEvent::CommunicationError {
                    error_type: error.kind(),
                    message: error.to_string(),
                    message_id: Some(message.id.clone()),
                })
                .await;
        }
    }

    async fn record_terminal(
        &self,
        message: &AgentMessage,
        agent_role: &str,
        error: &CommunicationError,
        retry_count: u32,
    ) {
        let moved_to_dlq = {
            let mut state = self.state.lock().await;
            state.total_errors += 1;
            *state.errors_by_type.entry(error.kind()).or_insert(0) += 1;
            *state
                .errors_by_agent
                .entry(agent_role.to_string())
                .or_insert(0) += 1;
            if self.config.dead_letter_queue_enabled {
                state.dead_letters.push(DeadLetterEntry {
                    message: message.clone(),
                    agent_role: agent_role.to_string(),
                    error: error.to_string(),
                    error_type: error.kind(),
                    retry_count,
                    timestamp: Utc::now(),
                });
                true
            } else {
                false
            }
        };

        if moved_to_dlq {
            log::info!("message {} moved to dead-letter queue", message.id);
            self.events
                .emit(CommunicationEvent::MessageMovedToDlq {
                    id: message.id.clone(),
                })
                .await;
        }
    }

    pub async fn get_error_stats(&self) -> ErrorStats {
        let state = self.state.lock().await;
        ErrorStats {
            total_errors: state.total_errors,
            errors_by_type: state.errors_by_type.clone(),
            dead_letter_queue_size: state.dead_letters.len(),
            failed_attempts: state.failed_attempts,
            errors_by_agent: state.errors_by_agent.clone(),
        }
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Remove and return every dead-letter entry, e.g. for reprocessing.
    pub async fn clear_dead_letter_queue(&self) -> Vec<DeadLetterEntry> {
        std::mem::take(&mut self.state.lock().await.dead_letters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn no_jitter() -> ErrorHandlerConfig {
        ErrorHandlerConfig {
            jitter_enabled: false,
            ..ErrorHandlerConfig::default()
        }
    }

    #[test]
    fn linear_policy_uses_base_delay() {
        let handler = CommunicationErrorHandler::new(ErrorHandlerConfig {
            exponential_backoff: false,
            jitter_enabled: false,
            base_retry_delay_ms: 250,
            ..ErrorHandlerConfig::default()
        });
        assert_eq!(handler.compute_retry_delay(0), Duration::from_millis(250));
        assert_eq!(handler.compute_retry_delay(7), Duration::from_millis(250));
    }

    #[test]
    fn huge_attempt_numbers_saturate_at_max() {
        let handler = CommunicationErrorHandler::new(no_jitter());
        assert_eq!(handler.compute_retry_delay(200), Duration::from_millis(30_000));
    }

    #[test]
    fn jitter_never_exceeds_max() {
        let handler = CommunicationErrorHandler::new(ErrorHandlerConfig::default())
            .with_jitter(Arc::new(FixedJitter(1.5)));
        assert_eq!(handler.compute_retry_delay(5), Duration::from_millis(30_000));
        assert_eq!(handler.compute_retry_delay(0), Duration::from_millis(1500));
    }

    #[test]
    fn seeded_jitter_is_reproducible_and_bounded() {
        let a = SeededJitter::seeded(42);
        let b = SeededJitter::seeded(42);
        for _ in 0..50 {
            let fa = a.factor();
            assert_eq!(fa, b.factor());
            assert!((0.5..=1.5).contains(&fa));
        }
    }

    #[tokio::test]
    async fn stops_retrying_at_max_and_dead_letters_once() {
        let handler = CommunicationErrorHandler::new(no_jitter());
        let msg = AgentMessage::new("supervisor", "research", "request", json!({}));
        let err = CommunicationError::DeliveryFailed("boom".into());

        let first = handler.handle_failure(&msg, "research", &err, 1).await;
        assert!(first.should_retry);
        assert_eq!(first.delay, Duration::from_millis(1000));

        let second = handler.handle_failure(&msg, "research", &err, 2).await;
        assert!(second.should_retry);
        assert_eq!(second.delay, Duration::from_millis(2000));

        let third = handler.handle_failure(&msg, "research", &err, 3).await;
        assert!(!third.should_retry);

        let stats = handler.get_error_stats().await;
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.failed_attempts, 3);
        assert_eq!(stats.dead_letter_queue_size, 1);
        assert_eq!(stats.errors_by_type[&ErrorKind::DeliveryFailed], 1);
        assert_eq!(stats.errors_by_agent["research"], 1);

        let letters = handler.dead_letters().await;
        assert_eq!(letters[0].retry_count, 3);
        assert_eq!(letters[0].message.id, msg.id);
    }

    #[tokio::test]
    async fn abandon_records_terminal_failure_without_counting_an_attempt() {
        let handler = CommunicationErrorHandler::new(no_jitter());
        let msg = AgentMessage::new("supervisor", "research", "request", json!({}));
        handler
            .abandon(&msg, "research", &CommunicationError::Timeout { elapsed_ms: 10 }, 1)
            .await;
        let stats = handler.get_error_stats().await;
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.failed_attempts, 0);
        assert_eq!(stats.dead_letter_queue_size, 1);
        assert_eq!(stats.errors_by_type[&ErrorKind::Timeout], 1);
    }

    #[tokio::test]
    async fn disabled_dlq_still_counts_errors() {
        let handler = CommunicationErrorHandler::new(ErrorHandlerConfig {
            dead_letter_queue_enabled: false,
            max_retries: 1,
            ..no_jitter()
        });
        let msg = AgentMessage::new("a", "b", "request", json!({}));
        handler
            .handle_failure(&msg, "b", &CommunicationError::DeliveryFailed("x".into()), 1)
            .await;
        let stats = handler.get_error_stats().await;
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.dead_letter_queue_size, 0);
        assert!(handler.clear_dead_letter_queue().await.is_empty());
    }
}
