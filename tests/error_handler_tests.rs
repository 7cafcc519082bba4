use agentmesh::bus::MessageBus;
use agentmesh::config::{ErrorHandlerConfig, MessageBusConfig};
use agentmesh::error::{CommunicationError, ErrorKind, HandlerError};
use agentmesh::error_handler::{CommunicationErrorHandler, FixedJitter, SeededJitter};
use agentmesh::event::{CommunicationEvent, EventFilter, EventHandler, EventKind};
use agentmesh::message::{AgentMessage, MessageTypePattern};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct DlqCounter {
    moved: AtomicUsize,
}

#[async_trait]
impl EventHandler for DlqCounter {
    async fn on_event(&self, event: &CommunicationEvent) {
        if let CommunicationEvent::MessageMovedToDlq { .. } = event {
            self.moved.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn test_exponential_delays_double_until_capped() {
    let handler = CommunicationErrorHandler::new(ErrorHandlerConfig {
        jitter_enabled: false,
        ..ErrorHandlerConfig::default()
    });
    let delays: Vec<Duration> = (0..7).map(|n| handler.compute_retry_delay(n)).collect();
    assert_eq!(
        delays,
        [1000, 2000, 4000, 8000, 16000, 30000, 30000]
            .into_iter()
            .map(Duration::from_millis)
            .collect::<Vec<_>>()
    );
}

#[test]
fn test_jitter_stays_within_bounds() {
    let config = ErrorHandlerConfig::default();
    let low = CommunicationErrorHandler::new(config.clone()).with_jitter(Arc::new(FixedJitter(0.5)));
    assert_eq!(low.compute_retry_delay(1), Duration::from_millis(1000));

    let seeded = CommunicationErrorHandler::new(config).with_jitter(Arc::new(SeededJitter::seeded(7)));
    for attempt in 0..10 {
        let pre_jitter = (1000u64 << attempt).min(30_000);
        let delay = seeded.compute_retry_delay(attempt).as_millis() as u64;
        assert!(delay >= pre_jitter / 2, "attempt {} gave {}ms", attempt, delay);
        assert!(delay <= 30_000);
    }
}

#[tokio::test]
async fn test_reporting_can_be_disabled() {
    let handler = CommunicationErrorHandler::new(ErrorHandlerConfig {
        error_reporting_enabled: false,
        max_retries: 1,
        ..ErrorHandlerConfig::default()
    });
    let counter = Arc::new(DlqCounter::default());
    handler.events().subscribe(EventFilter::All, counter.clone());
    let reported = Arc::new(AtomicUsize::new(0));

    struct ErrorCounter(Arc<AtomicUsize>);

    #[async_trait]
    impl EventHandler for ErrorCounter {
        async fn on_event(&self, _event: &CommunicationEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
    handler.events().subscribe(
        EventFilter::kinds([EventKind::CommunicationError]),
        Arc::new(ErrorCounter(Arc::clone(&reported))),
    );

    let msg = AgentMessage::new("a", "research", "request", json!({}));
    let decision = handler
        .handle_failure(&msg, "research", &CommunicationError::DeliveryFailed("x".into()), 1)
        .await;

    assert!(!decision.should_retry);
    assert_eq!(reported.load(Ordering::SeqCst), 0);
    assert_eq!(counter.moved.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_clearing_the_dead_letter_queue() {
    let handler = CommunicationErrorHandler::new(ErrorHandlerConfig {
        max_retries: 1,
        ..ErrorHandlerConfig::default()
    });
    for role in ["research", "analysis", "research"] {
        let msg = AgentMessage::new("a", role, "request", json!({}));
        handler
            .handle_failure(&msg, role, &CommunicationError::DeliveryFailed("x".into()), 1)
            .await;
    }

    let stats = handler.get_error_stats().await;
    assert_eq!(stats.total_errors, 3);
    assert_eq!(stats.dead_letter_queue_size, 3);
    assert_eq!(stats.errors_by_agent["research"], 2);
    assert_eq!(stats.errors_by_agent["analysis"], 1);

    let drained = handler.clear_dead_letter_queue().await;
    assert_eq!(drained.len(), 3);

    let stats = handler.get_error_stats().await;
    assert_eq!(stats.dead_letter_queue_size, 0);
    assert_eq!(stats.total_errors, 3);
}

#[tokio::test]
async fn test_bus_uses_injected_handler() {
    let bus = MessageBus::new(MessageBusConfig::default());
    let handler = Arc::new(
        CommunicationErrorHandler::new(ErrorHandlerConfig {
            max_retries: 2,
            base_retry_delay_ms: 1,
            max_retry_delay_ms: 2,
            ..ErrorHandlerConfig::default()
        })
        .with_jitter(Arc::new(SeededJitter::seeded(1)))
        .with_events(bus.events().clone()),
    );
    let bus = bus.with_error_handler(Arc::clone(&handler));
    let counter = Arc::new(DlqCounter::default());
    bus.events().subscribe(EventFilter::All, counter.clone());

    bus.subscribe_fn("research", vec![MessageTypePattern::Any], |_msg| async {
        Err::<(), HandlerError>("unreachable host".into())
    })
    .await;
    bus.send_message(AgentMessage::new("a", "research", "request", json!({})))
        .await
        .unwrap();
    bus.wait_idle().await;

    let stats = handler.get_error_stats().await;
    assert_eq!(stats.failed_attempts, 2);
    assert_eq!(stats.errors_by_type[&ErrorKind::DeliveryFailed], 1);
    assert_eq!(counter.moved.load(Ordering::SeqCst), 1);
}
