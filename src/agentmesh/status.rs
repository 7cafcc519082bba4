//! Per-role liveness, load and capability records read by the router.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Coarse activity state reported by an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Busy,
    Offline,
    Error,
}

/// What an agent role can do and how well it does it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub supported_tasks: Vec<String>,
    pub max_concurrent_tasks: usize,
    /// Mean processing time in milliseconds.
    pub average_processing_time: f64,
    /// Success ratio in `[0, 1]`.
    pub reliability: f64,
    #[serde(default)]
    pub specializations: Vec<String>,
}

impl Default for AgentCapabilities {
    fn default() -> Self {
        Self {
            supported_tasks: Vec::new(),
            max_concurrent_tasks: 1,
            average_processing_time: 0.0,
            reliability: 1.0,
            specializations: Vec::new(),
        }
    }
}

impl AgentCapabilities {
    pub fn supports(&self, task: &str) -> bool {
        self.supported_tasks.iter().any(|t| t == task)
    }
}

/// Latest reported status of one agent role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_type: String,
    pub status: AgentState,
    /// Identifiers of the tasks the agent is working on.
    pub current_tasks: Vec<String>,
    pub last_activity: DateTime<Utc>,
    pub capabilities: AgentCapabilities,
}

impl AgentStatus {
    /// Idle status with the given capabilities, stamped now.
    pub fn new(agent_type: impl Into<String>, capabilities: AgentCapabilities) -> Self {
        Self {
            agent_type: agent_type.into(),
            status: AgentState::Idle,
            current_tasks: Vec::new(),
            last_activity: Utc::now(),
            capabilities,
        }
    }

    pub fn with_state(mut self, status: AgentState) -> Self {
        self.status = status;
        self
    }

    pub fn with_tasks<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.current_tasks = tasks.into_iter().map(Into::into).collect();
        self
    }

    pub fn load(&self) -> usize {
        self.current_tasks.len()
    }

    pub fn is_at_capacity(&self) -> bool {
        self.load() >= self.capabilities.max_concurrent_tasks
    }

    /// Whether the agent can be routed to at all.
    pub fn is_available(&self) -> bool {
        !matches!(self.status, AgentState::Offline | AgentState::Error)
    }

    pub fn can_handle(&self, task: &str) -> bool {
        self.is_available() && self.capabilities.supports(task)
    }
}

/// Status records keyed by agent role. Updates replace the record wholesale.
#[derive(Default)]
pub struct AgentStatusTable {
    statuses: RwLock<HashMap<String, AgentStatus>>,
}

impl AgentStatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `status`, returning the record it replaced.
    pub async fn update(&self, status: AgentStatus) -> Option<AgentStatus> {
        self.statuses
            .write()
            .await
            .insert(status.agent_type.clone(), status)
    }

    pub async fn remove(&self, agent_type: &str) -> Option<AgentStatus> {
        self.statuses.write().await.remove(agent_type)
    }

    pub async fn get(&self, agent_type: &str) -> Option<AgentStatus> {
        self.statuses.read().await.get(agent_type).cloned()
    }

    /// All records, sorted by role.
    pub async fn all(&self) -> Vec<AgentStatus> {
        let mut all: Vec<AgentStatus> = self.statuses.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.agent_type.cmp(&b.agent_type));
        all
    }

    /// Available roles that list `task` as supported, sorted by role.
    pub async fn capable_of(&self, task: &str) -> Vec<AgentStatus> {
        let mut capable: Vec<AgentStatus> = self
            .statuses
            .read()
            .await
            .values()
            .filter(|s| s.can_handle(task))
            .cloned()
            .collect();
        capable.sort_by(|a, b| a.agent_type.cmp(&b.agent_type));
        capable
    }
}
