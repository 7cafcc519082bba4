//! Routed delivery on top of the [`MessageBus`].
//!
//! [`MessageRouter::route_message`] decides the effective recipient of a
//! message and then hands it to the bus:
//!
//! 1. the first matching [`RoutingRule`] (highest priority first) overrides
//!    the recipient
//! 2. if that recipient's circuit breaker is open, a healthy role able to
//!    handle the message's task is substituted, or the route fails with
//!    [`CommunicationError::TargetUnavailable`]
//! 3. otherwise, when no rule fired and several healthy roles can handle the
//!    task, the load balancer picks one
//! 4. the hop counter is incremented and checked against `max_routing_hops`
//! 5. transformers run and the message is sent through the bus
//!
//! Delivery outcomes flow back through the bus event stream. The router
//! listens for `message-delivered` and `message-retry-failed` on messages it
//! routed and feeds them to the target's circuit breaker.
//!
//! # Example
//!
//! ```rust
//! use agentmesh::bus::MessageBus;
//! use agentmesh::config::{MessageBusConfig, RouterConfig};
//! use agentmesh::message::{AgentMessage, MessageTypePattern, Recipient};
//! use agentmesh::router::MessageRouter;
//! use agentmesh::rules::RoutingRule;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = Arc::new(MessageBus::new(MessageBusConfig::default()));
//! bus.subscribe_fn("supervisor", vec![MessageTypePattern::Any], |_msg| async { Ok(()) }).await;
//!
//! let router = MessageRouter::new(RouterConfig::default(), Arc::clone(&bus));
//! router
//!     .add_routing_rule(RoutingRule::route("escalate", "supervisor", 100, |msg| {
//!         msg.content.get("urgency").and_then(|u| u.as_str()) == Some("critical")
//!     }))
//!     .await
//!     .unwrap();
//!
//! let alert = AgentMessage::new("research", "analysis", "alert", json!({"urgency": "critical"}));
//! let receipt = router.route_message(alert).await.unwrap();
//! assert_eq!(receipt.recipient, Recipient::agent("supervisor"));
//! # }
//! ```

use crate::agentmesh::bus::{MessageBus, MessageReceipt};
use crate::agentmesh::circuit_breaker::{
    BreakerTransition, CircuitBreakerRegistry, CircuitBreakerState, CircuitState, ManualRecovery,
    RecoveryPolicy,
};
use crate::agentmesh::config::RouterConfig;
use crate::agentmesh::error::CommunicationError;
use crate::agentmesh::event::{
    CommunicationEvent, EventDispatcher, EventFilter, EventHandler, EventKind, ListenerHandle,
};
use crate::agentmesh::load_balancer::{LoadBalancer, LoadBalancingStrategy};
use crate::agentmesh::message::{AgentMessage, Recipient};
use crate::agentmesh::rules::{RoutingRule, RuleSet};
use crate::agentmesh::status::{AgentStatus, AgentStatusTable};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;

/// Hook applied to routed messages when `enable_message_transformation` is set.
pub trait MessageTransformer: Send + Sync {
    fn transform(&self, message: AgentMessage) -> AgentMessage;
}

impl<F> MessageTransformer for F
where
    F: Fn(AgentMessage) -> AgentMessage + Send + Sync,
{
    fn transform(&self, message: AgentMessage) -> AgentMessage {
        self(message)
    }
}

/// Deliveries still outstanding for one routed message.
struct RouteTrack {
    target: String,
    seen: usize,
    /// Known once the bus has admitted the message.
    expected: Option<usize>,
}

/// Bus listener that turns delivery outcomes into breaker updates.
struct BreakerFeedback {
    breakers: Arc<CircuitBreakerRegistry>,
    routes: Mutex<HashMap<String, RouteTrack>>,
    events: EventDispatcher,
    enabled: bool,
}

impl BreakerFeedback {
    fn routes(&self) -> std::sync::MutexGuard<'_, HashMap<String, RouteTrack>> {
        self.routes.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn begin(&self, message_id: &str, target: &str) {
        self.routes().insert(
            message_id.to_string(),
            RouteTrack {
                target: target.to_string(),
                seen: 0,
                expected: None,
            },
        );
    }

    fn expect(&self, message_id: &str, deliveries: usize) {
        let mut routes = self.routes();
        let done = match routes.get_mut(message_id) {
            Some(track) => {
                track.expected = Some(deliveries);
                track.seen >= deliveries
            }
            None => false,
        };
        if done {
            routes.remove(message_id);
        }
    }

    fn cancel(&self, message_id: &str) {
        self.routes().remove(message_id);
    }

    /// Whether the outcome belongs to a routed message, consuming one slot.
    fn claim(&self, message_id: &str, agent_role: &str) -> bool {
        let mut routes = self.routes();
        let Some(track) = routes.get_mut(message_id) else {
            return false;
        };
        if track.target != agent_role {
            return false;
        }
        track.seen += 1;
        if matches!(track.expected, Some(expected) if track.seen >= expected) {
            routes.remove(message_id);
        }
        true
    }
}

#[async_trait]
impl EventHandler for BreakerFeedback {
    async fn on_event(&self, event: &CommunicationEvent) {
        let transition = match event {
            CommunicationEvent::MessageDelivered {
                message_id,
                agent_role,
                ..
            } => {
                if !self.claim(message_id, agent_role) || !self.enabled {
                    return;
                }
                self.breakers.record_success(agent_role)
            }
            CommunicationEvent::MessageRetryFailed {
                message_id,
                agent_role,
                ..
            } => {
                if !self.claim(message_id, agent_role) || !self.enabled {
                    return;
                }
                self.breakers.record_failure(agent_role)
            }
            _ => None,
        };
        if let Some(transition) = transition {
            self.events.emit(transition.into_event()).await;
        }
    }
}

pub struct MessageRouter {
    config: RouterConfig,
    bus: Arc<MessageBus>,
    rules: RwLock<RuleSet>,
    statuses: AgentStatusTable,
    balancer: LoadBalancer,
    breakers: Arc<CircuitBreakerRegistry>,
    feedback: Arc<BreakerFeedback>,
    feedback_listener: ListenerHandle,
    transformers: RwLock<Vec<Arc<dyn MessageTransformer>>>,
}

impl MessageRouter {
    /// Router whose open breakers stay open until [`reset_circuit_breaker`](Self::reset_circuit_breaker).
    pub fn new(config: RouterConfig, bus: Arc<MessageBus>) -> Self {
        Self::with_recovery_policy(config, bus, Box::new(ManualRecovery))
    }

    pub fn with_recovery_policy(
        config: RouterConfig,
        bus: Arc<MessageBus>,
        policy: Box<dyn RecoveryPolicy>,
    ) -> Self {
        let breakers = Arc::new(
            CircuitBreakerRegistry::new(config.circuit_breaker_threshold).with_policy(policy),
        );
        let events = bus.events().clone();
        let feedback = Arc::new(BreakerFeedback {
            breakers: Arc::clone(&breakers),
            routes: Mutex::new(HashMap::new()),
            events: events.clone(),
            enabled: config.enable_circuit_breaker && bus.error_handler().circuit_breaker_enabled(),
        });
        let feedback_listener = events.subscribe(
            EventFilter::kinds([EventKind::MessageDelivered, EventKind::MessageRetryFailed]),
            Arc::clone(&feedback) as Arc<dyn EventHandler>,
        );
        Self {
            balancer: LoadBalancer::new(config.load_balancing_strategy),
            config,
            bus,
            rules: RwLock::new(RuleSet::new()),
            statuses: AgentStatusTable::new(),
            breakers,
            feedback,
            feedback_listener,
            transformers: RwLock::new(Vec::new()),
        }
    }

    /// Replace the strategy named by `load_balancing_strategy` (builder pattern).
    pub fn with_strategy(mut self, strategy: Box<dyn LoadBalancingStrategy>) -> Self {
        self.balancer = LoadBalancer::with_strategy(strategy);
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn events(&self) -> &EventDispatcher {
        self.bus.events()
    }

    fn breakers_active(&self) -> bool {
        self.feedback.enabled
    }

    /// Fails with [`CommunicationError::DuplicateRule`] if the id is taken.
    pub async fn add_routing_rule(&self, rule: RoutingRule) -> Result<(), CommunicationError> {
        let id = rule.id.clone();
        self.rules.write().await.insert(rule)?;
        log::debug!("routing rule '{}' added", id);
        Ok(())
    }

    pub async fn remove_routing_rule(&self, id: &str) -> bool {
        self.rules.write().await.remove(id).is_some()
    }

    /// Rules in evaluation order.
    pub async fn routing_rules(&self) -> Vec<RoutingRule> {
        self.rules.read().await.rules().to_vec()
    }

    pub async fn update_agent_status(&self, status: AgentStatus) {
        log::debug!(
            "status for '{}': {:?}, {} task(s)",
            status.agent_type,
            status.status,
            status.load()
        );
        self.statuses.update(status).await;
    }

    pub async fn agent_status(&self, agent_type: &str) -> Option<AgentStatus> {
        self.statuses.get(agent_type).await
    }

    pub async fn agent_statuses(&self) -> Vec<AgentStatus> {
        self.statuses.all().await
    }

    pub async fn remove_agent_status(&self, agent_type: &str) -> Option<AgentStatus> {
        self.statuses.remove(agent_type).await
    }

    /// Register a transformer; they run in registration order.
    pub async fn add_transformer(&self, transformer: Arc<dyn MessageTransformer>) {
        self.transformers.write().await.push(transformer);
    }

    pub fn circuit_breaker_state(&self, agent_type: &str) -> Option<CircuitBreakerState> {
        self.breakers.state(agent_type)
    }

    /// Force `agent_type`'s breaker closed. Returns `false` if it was not open
    /// or half-open.
    pub async fn reset_circuit_breaker(&self, agent_type: &str) -> bool {
        match self.breakers.reset(agent_type) {
            Some(transition) => {
                self.events().emit(transition.into_event()).await;
                true
            }
            None => false,
        }
    }

    /// Run the recovery policy over every open breaker, emitting an event for
    /// each one moved to half-open.
    pub async fn check_circuit_breakers(&self) -> Vec<BreakerTransition> {
        let transitions = self.breakers.check_all();
        for transition in &transitions {
            self.events().emit(transition.clone().into_event()).await;
        }
        transitions
    }

    async fn is_open(&self, agent_type: &str) -> bool {
        if !self.breakers_active() {
            return false;
        }
        let (state, transition) = self.breakers.check(agent_type);
        if let Some(transition) = transition {
            self.events().emit(transition.into_event()).await;
        }
        state == CircuitState::Open
    }

    /// Available roles able to run `task` whose breaker is not open.
    async fn healthy_candidates(&self, task: &str, exclude: Option<&str>) -> Vec<AgentStatus> {
        let mut healthy = Vec::new();
        for status in self.statuses.capable_of(task).await {
            if Some(status.agent_type.as_str()) == exclude {
                continue;
            }
            if !self.is_open(&status.agent_type).await {
                healthy.push(status);
            }
        }
        healthy
    }

    /// Pick a role for `task` with the configured strategy.
    pub async fn select_agent(&self, task: &str) -> Result<String, CommunicationError> {
        let candidates = self.healthy_candidates(task, None).await;
        self.balancer
            .select(&candidates)
            .ok_or_else(|| CommunicationError::NoCapableAgent(task.to_string()))
    }

    /// Resolve the effective recipient and deliver through the bus.
    pub async fn route_message(&self, message: AgentMessage) -> Result<MessageReceipt, CommunicationError> {
        let mut message = message;
        let original = message.recipient.clone();

        let rule = self
            .rules
            .read()
            .await
            .first_match(&message)
            .map(|r| (r.id.clone(), r.target.clone()));
        let mut recipient = match &rule {
            Some((id, target)) => {
                log::info!(
                    "rule '{}' redirects message {} from '{}' to '{}'",
                    id,
                    message.id,
                    original,
                    target
                );
                Recipient::agent(target.clone())
            }
            None => original.clone(),
        };

        if let Some(role) = recipient.role().map(str::to_string) {
            let task = message.implied_task().map(str::to_string);
            if self.is_open(&role).await {
                let alternate = match &task {
                    Some(task) => {
                        let candidates = self.healthy_candidates(task, Some(&role)).await;
                        self.balancer.select(&candidates)
                    }
                    None => None,
                };
                match alternate {
                    Some(alternate) => {
                        log::info!(
                            "breaker for '{}' is open, routing message {} to '{}'",
                            role,
                            message.id,
                            alternate
                        );
                        recipient = Recipient::agent(alternate);
                    }
                    None => {
                        let err = CommunicationError::TargetUnavailable(role);
                        return Err(self.fail(&message, err).await);
                    }
                }
            } else if rule.is_none() && self.config.enable_load_balancing {
                if let Some(task) = &task {
                    let candidates = self.healthy_candidates(task, None).await;
                    if candidates.len() > 1 {
                        if let Some(picked) = self.balancer.select(&candidates) {
                            log::debug!(
                                "{} picked '{}' for task '{}' out of {} candidates",
                                self.balancer.strategy_name(),
                                picked,
                                task,
                                candidates.len()
                            );
                            recipient = Recipient::agent(picked);
                        }
                    }
                }
            }
        }

        let hops = message.metadata.routing_hops.saturating_add(1);
        if hops > self.config.max_routing_hops {
            let err = CommunicationError::HopLimitExceeded {
                hops,
                max_hops: self.config.max_routing_hops,
            };
            return Err(self.fail(&message, err).await);
        }
        message.metadata.routing_hops = hops;
        message.recipient = recipient;

        if self.config.enable_message_transformation {
            if message.metadata.original_recipient.is_none() {
                message.metadata.original_recipient = Some(original.clone());
            }
            let transformers = self.transformers.read().await.clone();
            for transformer in transformers {
                message = transformer.transform(message);
            }
        }

        let message_id = message.id.clone();
        let target = message.recipient.role().map(str::to_string);
        if let Some(target) = &target {
            self.feedback.begin(&message_id, target);
        }

        let receipt = match self.bus.send_message(message.clone()).await {
            Ok(receipt) => receipt,
            Err(err) => {
                self.feedback.cancel(&message_id);
                return Err(self.fail(&message, err).await);
            }
        };
        if target.is_some() {
            self.feedback.expect(&message_id, receipt.deliveries);
        }

        self.events()
            .emit(CommunicationEvent::MessageRouted {
                message_id,
                original_recipient: original.to_string(),
                recipient: receipt.recipient.to_string(),
                rule_id: rule.map(|(id, _)| id),
            })
            .await;
        Ok(receipt)
    }

    async fn fail(&self, message: &AgentMessage, err: CommunicationError) -> CommunicationError {
        log::warn!("failed to route message {}: {}", message.id, err);
        if self.bus.error_handler().config().error_reporting_enabled {
            self.events()
                .emit(CommunicationEvent::CommunicationError {
                    error_type: err.kind(),
                    message: err.to_string(),
                    message_id: Some(message.id.clone()),
                })
                .await;
        }
        err
    }
}

impl Drop for MessageRouter {
    fn drop(&mut self) {
        self.bus.events().unsubscribe(&self.feedback_listener);
    }
}
