// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! End-to-end publisher scenarios against an in-process transport.

use std::sync::Arc;
use std::time::Duration;

use switchboard_events::transport::mock::MockTransport;
use switchboard_events::{
    AuditEvent, CircuitState, Error, EventPublisher, EventTransport, EventType, PublisherConfig,
    Severity, SubscriptionFilter, TransportProtocol,
};
use switchboard_telemetry::{LatencyMonitor, MonitorConfig};

fn monitor() -> Arc<LatencyMonitor> {
    Arc::new(LatencyMonitor::new(MonitorConfig::default()))
}

fn event(event_type: EventType, severity: Severity, aggregate: &str) -> AuditEvent {
    AuditEvent::new(event_type, severity, "call", aggregate, "create", "success")
}

fn build(config: PublisherConfig) -> (Arc<EventPublisher>, Arc<MockTransport>) {
    let mock = Arc::new(MockTransport::new(TransportProtocol::Stream));
    let publisher = EventPublisher::new(
        config,
        vec![Arc::clone(&mock) as Arc<dyn EventTransport>],
        monitor(),
    )
    .expect("publisher builds");
    (publisher, mock)
}

async fn wait_for_deliveries(mock: &MockTransport, expected: usize, budget: Duration) {
    let deadline = tokio::time::Instant::now() + budget;
    while mock.recorded().len() < expected && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Scenario 1: a critical event published after a burst of Info events is
/// delivered through its own worker group; everything arrives.
#[tokio::test]
async fn critical_priority_delivery() {
    let (publisher, mock) = build(PublisherConfig {
        worker_count: 1,
        critical_workers: 1,
        event_queue_size: 10,
        critical_queue_size: 5,
        batch_worker_enabled: false,
        ordering_enabled: false,
        dedup_enabled: false,
        dlq_retry_interval: Duration::from_secs(3600),
        dlq_purge_interval: Duration::from_secs(3600),
        ..PublisherConfig::default()
    });
    publisher
        .subscribe("ops", TransportProtocol::Stream, SubscriptionFilter::match_all())
        .expect("subscribe");

    // Slow the shared transport slightly so the Info backlog is real.
    mock.set_delay(Duration::from_millis(10));

    for i in 0..5 {
        publisher
            .publish(event(EventType::CallCreated, Severity::Info, &format!("call-{i}")))
            .await
            .expect("publish info");
    }
    publisher
        .publish(event(
            EventType::ComplianceViolation,
            Severity::Critical,
            "call-critical",
        ))
        .await
        .expect("publish critical");

    wait_for_deliveries(&mock, 6, Duration::from_secs(5)).await;
    let recorded = mock.recorded();
    assert_eq!(recorded.len(), 6, "all six events observed at the transport");
    assert!(
        recorded.iter().any(|r| r.aggregate_id == "call-critical"),
        "critical event delivered"
    );
    // The critical worker group never waits behind the Info backlog: with a
    // 10ms send, the critical event cannot be the last arrival.
    let critical_pos = recorded
        .iter()
        .position(|r| r.aggregate_id == "call-critical")
        .expect("critical recorded");
    assert!(critical_pos < 5, "critical event jumped the Info backlog");

    publisher.close().await.expect("close");
}

/// Scenario 2: two filtered subscriptions each receive only their events.
#[tokio::test]
async fn router_filtering_per_subscription() {
    let (publisher, mock) = build(PublisherConfig {
        worker_count: 1,
        critical_workers: 1,
        batch_worker_enabled: false,
        ordering_enabled: false,
        dedup_enabled: false,
        dlq_retry_interval: Duration::from_secs(3600),
        dlq_purge_interval: Duration::from_secs(3600),
        ..PublisherConfig::default()
    });

    let s1 = publisher
        .subscribe(
            "calls-team",
            TransportProtocol::Stream,
            SubscriptionFilter::match_all()
                .with_event_types([EventType::CallCreated])
                .with_severities([Severity::Info]),
        )
        .expect("subscribe s1");
    let s2 = publisher
        .subscribe(
            "bids-team",
            TransportProtocol::Stream,
            SubscriptionFilter::match_all()
                .with_event_types([EventType::BidCreated])
                .with_severities([Severity::High]),
        )
        .expect("subscribe s2");

    let call_event = event(EventType::CallCreated, Severity::Info, "call-1");
    let bid_event = event(EventType::BidCreated, Severity::High, "bid-1");
    publisher.publish(call_event.clone()).await.expect("publish call");
    publisher.publish(bid_event.clone()).await.expect("publish bid");

    wait_for_deliveries(&mock, 2, Duration::from_secs(5)).await;
    let recorded = mock.recorded();
    assert_eq!(recorded.len(), 2);

    let call_send = recorded
        .iter()
        .find(|r| r.event_id == call_event.id)
        .expect("call event sent");
    assert_eq!(call_send.subscriber_ids, vec![s1.id]);

    let bid_send = recorded
        .iter()
        .find(|r| r.event_id == bid_event.id)
        .expect("bid event sent");
    assert_eq!(bid_send.subscriber_ids, vec![s2.id]);

    publisher.close().await.expect("close");
}

/// Scenario 3: a slow transport backs the queues up; publishes drop with
/// `QueueFull`, the circuit opens after the threshold, and it recloses only
/// after the reset timeout.
#[tokio::test]
async fn backpressure_drop_opens_circuit() {
    let (publisher, mock) = build(PublisherConfig {
        worker_count: 1,
        critical_workers: 1,
        event_queue_size: 5,
        critical_queue_size: 5,
        max_queue_depth: 3,
        backpressure_delay: Duration::from_millis(10),
        failure_threshold: 3,
        reset_timeout: Duration::from_millis(200),
        half_open_limit: 1,
        batch_worker_enabled: false,
        ordering_enabled: false,
        dedup_enabled: false,
        dlq_retry_interval: Duration::from_secs(3600),
        dlq_purge_interval: Duration::from_secs(3600),
        ..PublisherConfig::default()
    });
    publisher
        .subscribe("ops", TransportProtocol::Stream, SubscriptionFilter::match_all())
        .expect("subscribe");
    mock.set_delay(Duration::from_millis(50));

    let mut queue_full = 0;
    let mut circuit_open = 0;
    for i in 0..10 {
        match publisher
            .publish(event(EventType::CallCreated, Severity::Info, &format!("call-{i}")))
            .await
        {
            Ok(()) => {}
            Err(Error::QueueFull(_)) => queue_full += 1,
            Err(Error::CircuitOpen) => circuit_open += 1,
            Err(other) => panic!("unexpected error {other}"),
        }
    }

    assert!(queue_full >= 1, "at least one publish hit QueueFull");
    assert!(
        publisher.metrics().events_dropped > 0,
        "drops counted in metrics"
    );
    assert!(
        queue_full >= 3 || circuit_open > 0,
        "circuit opened after repeated failures"
    );
    assert_eq!(publisher.backpressure().state(), CircuitState::Open);

    // Still rejecting before the reset timeout elapses.
    assert!(matches!(
        publisher
            .publish(event(EventType::CallCreated, Severity::Info, "early"))
            .await
            .unwrap_err(),
        Error::CircuitOpen
    ));

    // Let the queue drain and the reset timeout pass, then a probe closes
    // the breaker.
    tokio::time::sleep(Duration::from_millis(500)).await;
    publisher
        .publish(event(EventType::CallCreated, Severity::Info, "probe"))
        .await
        .expect("probe publish after reset timeout");
    assert_eq!(publisher.backpressure().state(), CircuitState::Closed);

    publisher.close().await.expect("close");
}

/// Scenario 4: out-of-order publishes for one aggregate deliver in
/// ascending sequence order.
#[tokio::test]
async fn per_aggregate_ordering() {
    let (publisher, mock) = build(PublisherConfig {
        worker_count: 1,
        critical_workers: 1,
        batch_worker_enabled: false,
        ordering_enabled: true,
        ordering_timeout: Duration::from_secs(2),
        dedup_enabled: false,
        dlq_retry_interval: Duration::from_secs(3600),
        dlq_purge_interval: Duration::from_secs(3600),
        ..PublisherConfig::default()
    });
    publisher
        .subscribe("ops", TransportProtocol::Stream, SubscriptionFilter::match_all())
        .expect("subscribe");

    for seq in [3u64, 1, 2] {
        publisher
            .publish(
                event(EventType::CallCreated, Severity::Info, "call-A").with_sequence(seq),
            )
            .await
            .expect("publish");
    }

    wait_for_deliveries(&mock, 3, Duration::from_secs(5)).await;
    assert_eq!(mock.sequences_for("call-A"), vec![1, 2, 3]);

    publisher.close().await.expect("close");
}

/// A gap that outlives the ordering timeout releases buffered events
/// instead of stalling the aggregate.
#[tokio::test]
async fn ordering_gap_releases_after_timeout() {
    let (publisher, mock) = build(PublisherConfig {
        worker_count: 1,
        critical_workers: 1,
        batch_worker_enabled: false,
        ordering_enabled: true,
        ordering_timeout: Duration::from_millis(100),
        dedup_enabled: false,
        dlq_retry_interval: Duration::from_secs(3600),
        dlq_purge_interval: Duration::from_secs(3600),
        ..PublisherConfig::default()
    });
    publisher
        .subscribe("ops", TransportProtocol::Stream, SubscriptionFilter::match_all())
        .expect("subscribe");

    // Sequence 1 never arrives.
    for seq in [2u64, 3] {
        publisher
            .publish(
                event(EventType::CallCreated, Severity::Info, "call-A").with_sequence(seq),
            )
            .await
            .expect("publish");
    }
    assert!(mock.recorded().is_empty(), "gapped events held back");

    wait_for_deliveries(&mock, 2, Duration::from_secs(5)).await;
    assert_eq!(mock.sequences_for("call-A"), vec![2, 3]);

    publisher.close().await.expect("close");
}

/// Boundary: a critical event with a full critical queue falls through to
/// the normal queue; with both full it is dropped and counted.
#[tokio::test]
async fn critical_queue_fall_through_and_drop() {
    let (publisher, mock) = build(PublisherConfig {
        worker_count: 1,
        critical_workers: 1,
        event_queue_size: 2,
        critical_queue_size: 2,
        max_queue_depth: 100,
        shutdown_timeout: Duration::from_millis(200),
        batch_worker_enabled: false,
        ordering_enabled: false,
        dedup_enabled: false,
        dlq_retry_interval: Duration::from_secs(3600),
        dlq_purge_interval: Duration::from_secs(3600),
        ..PublisherConfig::default()
    });
    publisher
        .subscribe("ops", TransportProtocol::Stream, SubscriptionFilter::match_all())
        .expect("subscribe");
    // Both worker groups wedge on their first event.
    mock.set_delay(Duration::from_secs(30));

    let critical =
        |i: usize| event(EventType::ComplianceViolation, Severity::Critical, &format!("c-{i}"));

    // One event per worker group to occupy them.
    publisher.publish(critical(0)).await.expect("occupy critical worker");
    tokio::time::sleep(Duration::from_millis(50)).await;
    publisher.publish(event(EventType::CallCreated, Severity::Info, "n-0"))
        .await
        .expect("occupy normal worker");
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Fill the critical queue exactly to capacity.
    publisher.publish(critical(1)).await.expect("critical slot 1");
    publisher.publish(critical(2)).await.expect("critical slot 2");

    // Fall-through: the critical queue is full, so these land on the
    // normal queue until it too is full.
    publisher.publish(critical(3)).await.expect("fall through 1");
    publisher.publish(critical(4)).await.expect("fall through 2");

    // Everything is full now: the next critical event drops.
    let err = publisher.publish(critical(5)).await.unwrap_err();
    assert!(matches!(err, Error::QueueFull(_)));

    let metrics = publisher.metrics();
    assert!(metrics.events_dropped_queue_full >= 1);
    publisher.close().await.expect("close");
}

/// Idempotence: publishing the same event id twice within the dedup window
/// delivers exactly once per matching subscription.
#[tokio::test]
async fn dedup_single_delivery() {
    let (publisher, mock) = build(PublisherConfig {
        worker_count: 1,
        critical_workers: 1,
        batch_worker_enabled: false,
        ordering_enabled: false,
        dedup_enabled: true,
        dedup_window: Duration::from_secs(300),
        dlq_retry_interval: Duration::from_secs(3600),
        dlq_purge_interval: Duration::from_secs(3600),
        ..PublisherConfig::default()
    });
    publisher
        .subscribe("ops", TransportProtocol::Stream, SubscriptionFilter::match_all())
        .expect("subscribe");

    let e = event(EventType::CallCreated, Severity::Info, "call-1");
    publisher.publish(e.clone()).await.expect("first publish");
    publisher.publish(e).await.expect("duplicate publish is silent");

    wait_for_deliveries(&mock, 1, Duration::from_secs(5)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mock.recorded().len(), 1, "exactly one delivery");

    publisher.close().await.expect("close");
}

/// Accounting: published + failed + dropped equals submissions once idle.
#[tokio::test]
async fn accounting_invariant_holds_when_idle() {
    let (publisher, mock) = build(PublisherConfig {
        worker_count: 2,
        critical_workers: 1,
        batch_worker_enabled: false,
        ordering_enabled: false,
        dedup_enabled: true,
        dlq_retry_interval: Duration::from_secs(3600),
        dlq_purge_interval: Duration::from_secs(3600),
        ..PublisherConfig::default()
    });
    publisher
        .subscribe("ops", TransportProtocol::Stream, SubscriptionFilter::match_all())
        .expect("subscribe");

    let mut submitted = 0u64;
    let repeated = event(EventType::CallCreated, Severity::Info, "call-dup");
    for i in 0..30 {
        let e = if i % 5 == 0 {
            repeated.clone()
        } else {
            event(EventType::CallCreated, Severity::Info, &format!("call-{i}"))
        };
        if publisher.publish(e).await.is_ok() {
            submitted += 1;
        }
    }

    wait_for_deliveries(&mock, 25, Duration::from_secs(5)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let m = publisher.metrics();
    assert_eq!(m.events_published + m.events_failed + m.events_dropped, submitted);

    publisher.close().await.expect("close");
}
