//! Priority-ordered routing rules.
//!
//! A rule pairs a predicate over a message with a target role. Rules are kept
//! in descending priority order (insertion order among equal priorities) and
//! the first rule whose condition holds decides the destination.
//!
//! Conditions must be pure: they are called on every routed message from
//! concurrent tasks and must not capture mutable state.
//!
//! ```rust
//! use agentmesh::rules::RoutingRule;
//! use agentmesh::message::AgentMessage;
//! use serde_json::json;
//!
//! let escalate = RoutingRule::route("critical-to-supervisor", "supervisor", 100, |msg| {
//!     msg.content.get("urgency").and_then(|u| u.as_str()) == Some("critical")
//! });
//!
//! let msg = AgentMessage::new("research", "analysis", "alert", json!({"urgency": "critical"}));
//! assert!(escalate.applies_to(&msg));
//! ```

use crate::agentmesh::error::CommunicationError;
use crate::agentmesh::message::AgentMessage;
use std::fmt;
use std::sync::Arc;

/// Pure predicate over a message.
pub type RuleCondition = Arc<dyn Fn(&AgentMessage) -> bool + Send + Sync>;

/// What a matching rule does with the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingAction {
    /// Replace the recipient with the rule's target.
    Route,
}

#[derive(Clone)]
pub struct RoutingRule {
    pub id: String,
    pub condition: RuleCondition,
    pub action: RoutingAction,
    pub target: String,
    /// Higher values are evaluated first.
    pub priority: i32,
}

impl RoutingRule {
    pub fn route<F>(id: impl Into<String>, target: impl Into<String>, priority: i32, condition: F) -> Self
    where
        F: Fn(&AgentMessage) -> bool + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            condition: Arc::new(condition),
            action: RoutingAction::Route,
            target: target.into(),
            priority,
        }
    }

    pub fn applies_to(&self, message: &AgentMessage) -> bool {
        (self.condition)(message)
    }
}

impl fmt::Debug for RoutingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingRule")
            .field("id", &self.id)
            .field("action", &self.action)
            .field("target", &self.target)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Ordered rule list with unique ids.
#[derive(Debug, Default, Clone)]
pub struct RuleSet {
    rules: Vec<RoutingRule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rule: RoutingRule) -> Result<(), CommunicationError> {
        if self.rules.iter().any(|r| r.id == rule.id) {
            return Err(CommunicationError::DuplicateRule(rule.id));
        }
        // after every rule with priority >= the new one keeps insertion order
        let position = self
            .rules
            .iter()
            .position(|r| r.priority < rule.priority)
            .unwrap_or(self.rules.len());
        self.rules.insert(position, rule);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<RoutingRule> {
        let position = self.rules.iter().position(|r| r.id == id)?;
        Some(self.rules.remove(position))
    }

    /// First rule, in priority order, whose condition holds.
    pub fn first_match(&self, message: &AgentMessage) -> Option<&RoutingRule> {
        self.rules.iter().find(|r| r.applies_to(message))
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn always(id: &str, target: &str, priority: i32) -> RoutingRule {
        RoutingRule::route(id, target, priority, |_| true)
    }

    fn ids(set: &RuleSet) -> Vec<&str> {
        set.rules().iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn keeps_descending_priority_and_insertion_order() {
        let mut set = RuleSet::new();
        set.insert(always("low", "a", 1)).unwrap();
        set.insert(always("high", "b", 10)).unwrap();
        set.insert(always("mid-1", "c", 5)).unwrap();
        set.insert(always("mid-2", "d", 5)).unwrap();
        assert_eq!(ids(&set), vec!["high", "mid-1", "mid-2", "low"]);
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut set = RuleSet::new();
        set.insert(always("r1", "a", 1)).unwrap();
        let err = set.insert(always("r1", "b", 9)).unwrap_err();
        assert_eq!(err, CommunicationError::DuplicateRule("r1".into()));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn first_match_wins() {
        let mut set = RuleSet::new();
        set.insert(RoutingRule::route("alerts", "compliance", 5, |m| m.message_type == "alert"))
            .unwrap();
        set.insert(always("fallback", "planning", 1)).unwrap();

        let alert = AgentMessage::new("a", "research", "alert", json!({}));
        assert_eq!(set.first_match(&alert).unwrap().target, "compliance");

        let request = AgentMessage::new("a", "research", "request", json!({}));
        assert_eq!(set.first_match(&request).unwrap().target, "planning");

        assert!(set.remove("fallback").is_some());
        assert!(set.first_match(&request).is_none());
    }
}
