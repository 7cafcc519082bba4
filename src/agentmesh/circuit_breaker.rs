//! Per-role circuit breakers.
//!
//! ```text
//! closed ──(failure_count >= threshold)──▶ open
//!   ▲                                        │ RecoveryPolicy says retry
//!   │ success                                ▼
//!   └──────────────────────────────────── half-open ──(failure)──▶ open
//! ```
//!
//! The registry only computes transitions; the router turns them into
//! events after the breaker lock is released.

use crate::agentmesh::event::CommunicationEvent;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerState {
    /// Failures since the breaker last closed.
    pub failure_count: u32,
    pub threshold: u32,
    pub state: CircuitState,
    /// When the breaker last opened.
    pub opened_at: Option<Instant>,
}

impl CircuitBreakerState {
    fn new(threshold: u32) -> Self {
        Self {
            failure_count: 0,
            threshold,
            state: CircuitState::Closed,
            opened_at: None,
        }
    }
}

/// Decides when an open breaker may let a trial message through.
pub trait RecoveryPolicy: Send + Sync {
    fn should_attempt_reset(&self, breaker: &CircuitBreakerState, now: Instant) -> bool;
}

/// Breakers stay open until reset explicitly.
pub struct ManualRecovery;

impl RecoveryPolicy for ManualRecovery {
    fn should_attempt_reset(&self, _breaker: &CircuitBreakerState, _now: Instant) -> bool {
        false
    }
}

/// Half-open a breaker once it has been open for `cooldown`.
pub struct CooldownRecovery {
    pub cooldown: Duration,
}

impl RecoveryPolicy for CooldownRecovery {
    fn should_attempt_reset(&self, breaker: &CircuitBreakerState, now: Instant) -> bool {
        breaker
            .opened_at
            .map(|opened| now.saturating_duration_since(opened) >= self.cooldown)
            .unwrap_or(false)
    }
}

/// State change produced by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerTransition {
    Opened { agent_type: String, failure_count: u32 },
    HalfOpened { agent_type: String },
    Closed { agent_type: String },
}

impl BreakerTransition {
    pub fn into_event(self) -> CommunicationEvent {
        match self {
            BreakerTransition::Opened {
                agent_type,
                failure_count,
            } => CommunicationEvent::CircuitBreakerOpened {
                agent_type,
                failure_count,
            },
            BreakerTransition::HalfOpened { agent_type } => {
                CommunicationEvent::CircuitBreakerHalfOpen { agent_type }
            }
            BreakerTransition::Closed { agent_type } => {
                CommunicationEvent::CircuitBreakerClosed { agent_type }
            }
        }
    }
}

pub struct CircuitBreakerRegistry {
    threshold: u32,
    policy: Box<dyn RecoveryPolicy>,
    breakers: Mutex<HashMap<String, CircuitBreakerState>>,
}

impl CircuitBreakerRegistry {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            policy: Box::new(ManualRecovery),
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_policy(mut self, policy: Box<dyn RecoveryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CircuitBreakerState>> {
        self.breakers.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current state of `agent_type`, moving an open breaker to half-open
    /// when the recovery policy allows it.
    pub fn check(&self, agent_type: &str) -> (CircuitState, Option<BreakerTransition>) {
        let mut breakers = self.lock();
        let Some(breaker) = breakers.get_mut(agent_type) else {
            return (CircuitState::Closed, None);
        };
        let transition = self.try_half_open(agent_type, breaker, Instant::now());
        (breaker.state, transition)
    }

    /// Run the recovery policy over every open breaker.
    pub fn check_all(&self) -> Vec<BreakerTransition> {
        let now = Instant::now();
        let mut breakers = self.lock();
        breakers
            .iter_mut()
            .filter_map(|(agent_type, breaker)| self.try_half_open(agent_type, breaker, now))
            .collect()
    }

    fn try_half_open(
        &self,
        agent_type: &str,
        breaker: &mut CircuitBreakerState,
        now: Instant,
    ) -> Option<BreakerTransition> {
        if breaker.state != CircuitState::Open || !self.policy.should_attempt_reset(breaker, now) {
            return None;
        }
        breaker.state = CircuitState::HalfOpen;
        log::info!("circuit breaker for '{}' half-open", agent_type);
        Some(BreakerTransition::HalfOpened {
            agent_type: agent_type.to_string(),
        })
    }

    pub fn record_failure(&self, agent_type: &str) -> Option<BreakerTransition> {
        let threshold = self.threshold;
        let mut breakers = self.lock();
        let breaker = breakers
            .entry(agent_type.to_string())
            .or_insert_with(|| CircuitBreakerState::new(threshold));
        breaker.failure_count = breaker.failure_count.saturating_add(1);

        let opens = match breaker.state {
            CircuitState::Closed => breaker.failure_count >= breaker.threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if !opens {
            return None;
        }
        breaker.state = CircuitState::Open;
        breaker.opened_at = Some(Instant::now());
        log::warn!(
            "circuit breaker for '{}' opened after {} failure(s)",
            agent_type,
            breaker.failure_count
        );
        Some(BreakerTransition::Opened {
            agent_type: agent_type.to_string(),
            failure_count: breaker.failure_count,
        })
    }

    /// A delivery succeeded. Closes a half-open breaker and clears the
    /// failure count of a closed one.
    pub fn record_success(&self, agent_type: &str) -> Option<BreakerTransition> {
        let mut breakers = self.lock();
        let breaker = breakers.get_mut(agent_type)?;
        match breaker.state {
            CircuitState::Closed => {
                breaker.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                *breaker = CircuitBreakerState::new(breaker.threshold);
                log::info!("circuit breaker for '{}' closed", agent_type);
                Some(BreakerTransition::Closed {
                    agent_type: agent_type.to_string(),
                })
            }
            CircuitState::Open => None,
        }
    }

    /// Force a breaker closed.
    pub fn reset(&self, agent_type: &str) -> Option<BreakerTransition> {
        let mut breakers = self.lock();
        let breaker = breakers.remove(agent_type)?;
        if breaker.state == CircuitState::Closed {
            return None;
        }
        log::info!("circuit breaker for '{}' reset", agent_type);
        Some(BreakerTransition::Closed {
            agent_type: agent_type.to_string(),
        })
    }

    pub fn state(&self, agent_type: &str) -> Option<CircuitBreakerState> {
        self.lock().get(agent_type).cloned()
    }
}
