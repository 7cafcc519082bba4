//! Candidate selection among capable agent roles.
//!
//! The router hands the balancer the status records of every role able to
//! handle a message's task. Roles already at `max_concurrent_tasks` are only
//! considered when every candidate is full.

use crate::agentmesh::config::LoadBalancingStrategyKind;
use crate::agentmesh::status::AgentStatus;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

/// Picks one role out of a non-empty, name-sorted candidate list.
pub trait LoadBalancingStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn pick<'a>(&self, candidates: &'a [AgentStatus]) -> Option<&'a AgentStatus>;
}

fn by_reliability_desc(a: &AgentStatus, b: &AgentStatus) -> Ordering {
    b.capabilities
        .reliability
        .partial_cmp(&a.capabilities.reliability)
        .unwrap_or(Ordering::Equal)
}

/// Fewest current tasks, ties broken by highest reliability.
pub struct LeastBusy;

impl LoadBalancingStrategy for LeastBusy {
    fn name(&self) -> &'static str {
        "least-busy"
    }

    fn pick<'a>(&self, candidates: &'a [AgentStatus]) -> Option<&'a AgentStatus> {
        candidates
            .iter()
            .min_by(|a, b| a.load().cmp(&b.load()).then_with(|| by_reliability_desc(a, b)))
    }
}

/// Rotates through candidates.
#[derive(Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl LoadBalancingStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn pick<'a>(&self, candidates: &'a [AgentStatus]) -> Option<&'a AgentStatus> {
        if candidates.is_empty() {
            return None;
        }
        let turn = self.next.fetch_add(1, AtomicOrdering::Relaxed);
        candidates.get(turn % candidates.len())
    }
}

/// Lowest average processing time, ties broken by highest reliability.
pub struct FastestResponse;

impl LoadBalancingStrategy for FastestResponse {
    fn name(&self) -> &'static str {
        "fastest-response"
    }

    fn pick<'a>(&self, candidates: &'a [AgentStatus]) -> Option<&'a AgentStatus> {
        candidates.iter().min_by(|a, b| {
            a.capabilities
                .average_processing_time
                .partial_cmp(&b.capabilities.average_processing_time)
                .unwrap_or(Ordering::Equal)
                .then_with(|| by_reliability_desc(a, b))
        })
    }
}

pub fn strategy_for(kind: LoadBalancingStrategyKind) -> Box<dyn LoadBalancingStrategy> {
    match kind {
        LoadBalancingStrategyKind::LeastBusy => Box::new(LeastBusy),
        LoadBalancingStrategyKind::RoundRobin => Box::new(RoundRobin::default()),
        LoadBalancingStrategyKind::FastestResponse => Box::new(FastestResponse),
    }
}

/// Strategy plus the capacity filter.
pub struct LoadBalancer {
    strategy: Box<dyn LoadBalancingStrategy>,
}

impl LoadBalancer {
    pub fn new(kind: LoadBalancingStrategyKind) -> Self {
        Self {
            strategy: strategy_for(kind),
        }
    }

    pub fn with_strategy(strategy: Box<dyn LoadBalancingStrategy>) -> Self {
        Self { strategy }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Choose a role from `candidates`, preferring roles with spare capacity.
    pub fn select(&self, candidates: &[AgentStatus]) -> Option<String> {
        let with_room: Vec<AgentStatus> = candidates
            .iter()
            .filter(|c| !c.is_at_capacity())
            .cloned()
            .collect();
        let pool = if with_room.is_empty() { candidates } else { &with_room[..] };
        self.strategy.pick(pool).map(|s| s.agent_type.clone())
    }
}
