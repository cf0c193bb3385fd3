// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The event publisher: ingest, prioritized queueing, worker fan-out,
//! micro-batching, per-subscription delivery stats, and shutdown draining.
//!
//! Two bounded queues feed disjoint worker groups; Critical events try the
//! critical queue first and fall through to the normal queue when it is
//! full. One batch worker opportunistically drains the normal queue into
//! micro-batches, racing the single-event workers on the same channel so
//! an event takes exactly one path.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use switchboard_telemetry::LatencyMonitor;

use crate::backpressure::{BackpressureConfig, BackpressureController};
use crate::config::PublisherConfig;
use crate::dlq::{DeadLetterQueue, DlqConfig, Redeliver};
use crate::errors::{Error, Result};
use crate::event::AuditEvent;
use crate::filter::SubscriptionFilter;
use crate::metrics::{PublisherMetrics, PublisherMetricsSnapshot};
use crate::ordering::{Deduplicator, OrderingBuffer};
use crate::router::SubscriptionRouter;
use crate::store::EventStore;
use crate::transport::{EventTransport, TransportProtocol};

/// Operation label for delivery latency in the shared monitor.
const DELIVERY_OPERATION: &str = "event_delivery";

/// A registered subscription. The filter is immutable after registration;
/// replacing it means unsubscribe + subscribe.
#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: String,
    pub protocol: TransportProtocol,
    pub filter: SubscriptionFilter,
    pub created_at: DateTime<Utc>,
}

/// Per-subscription delivery statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    /// EMA over delivery latency: `avg = (avg + sample) / 2`.
    pub avg_latency_us: u64,
}

impl DeliveryStats {
    fn note_success(&mut self, elapsed_us: u64) {
        self.success_count += 1;
        self.last_success = Some(Utc::now());
        self.avg_latency_us = if self.avg_latency_us > 0 {
            (self.avg_latency_us + elapsed_us) / 2
        } else {
            elapsed_us
        };
    }

    fn note_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Utc::now());
    }
}

struct SubscriptionEntry {
    meta: Subscription,
    stats: Mutex<DeliveryStats>,
}

/// Health surface.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub reasons: Vec<String>,
    pub normal_queue_utilization: f64,
    pub critical_queue_utilization: f64,
}

#[derive(Clone, Copy)]
enum QueueKind {
    Normal,
    Critical,
}

/// Shared enqueue path used by `publish` and dead-letter redelivery.
/// Critical events try the critical queue first and fall through.
fn enqueue_event(
    normal_tx: &mpsc::Sender<AuditEvent>,
    critical_tx: &mpsc::Sender<AuditEvent>,
    metrics: &PublisherMetrics,
    backpressure: &BackpressureController,
    event: AuditEvent,
) -> Result<()> {
    use mpsc::error::TrySendError;

    let event = if event.severity.is_critical() {
        match critical_tx.try_send(event) {
            Ok(()) => {
                backpressure.note_enqueued();
                metrics.critical_queue_depth.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(TrySendError::Full(event)) => {
                tracing::warn!(
                    event_id = %event.id,
                    "critical queue full, falling through to normal queue"
                );
                event
            }
            Err(TrySendError::Closed(_)) => return Err(Error::Shutdown),
        }
    } else {
        event
    };

    match normal_tx.try_send(event) {
        Ok(()) => {
            backpressure.note_enqueued();
            metrics.normal_queue_depth.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        Err(TrySendError::Full(event)) => {
            metrics
                .events_dropped_queue_full
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(event_id = %event.id, "both queues full, dropping event");
            Err(Error::QueueFull("normal queue at capacity".to_string()))
        }
        Err(TrySendError::Closed(_)) => Err(Error::Shutdown),
    }
}

/// Dead-letter redelivery sink over the publisher's queues. Redelivered
/// events bypass validation and dedup (they already passed both) but still
/// respect queue bounds.
struct EnqueueSink {
    normal_tx: mpsc::Sender<AuditEvent>,
    critical_tx: mpsc::Sender<AuditEvent>,
    metrics: Arc<PublisherMetrics>,
    backpressure: Arc<BackpressureController>,
}

#[async_trait]
impl Redeliver for EnqueueSink {
    async fn redeliver(&self, event: AuditEvent) -> Result<()> {
        enqueue_event(
            &self.normal_tx,
            &self.critical_tx,
            &self.metrics,
            &self.backpressure,
            event,
        )
    }
}

/// Real-time audit event publisher.
pub struct EventPublisher {
    config: PublisherConfig,
    router: Arc<SubscriptionRouter>,
    subscriptions: DashMap<Uuid, SubscriptionEntry>,
    transports: HashMap<TransportProtocol, Arc<dyn EventTransport>>,
    backpressure: Arc<BackpressureController>,
    dlq: Arc<DeadLetterQueue>,
    ordering: Option<Arc<OrderingBuffer>>,
    dedup: Option<Arc<Deduplicator>>,
    store: Option<Arc<dyn EventStore>>,
    metrics: Arc<PublisherMetrics>,
    monitor: Arc<LatencyMonitor>,
    normal_tx: mpsc::Sender<AuditEvent>,
    critical_tx: mpsc::Sender<AuditEvent>,
    normal_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<AuditEvent>>>,
    critical_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<AuditEvent>>>,
    /// Per-aggregate sequence assignment for events published with seq 0.
    seq_counters: DashMap<String, AtomicU64>,
    /// Per-aggregate hash-chain tails.
    last_hashes: DashMap<String, Vec<u8>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl EventPublisher {
    /// Build the publisher and spawn its workers and background cycles.
    pub fn new(
        config: PublisherConfig,
        transports: Vec<Arc<dyn EventTransport>>,
        monitor: Arc<LatencyMonitor>,
    ) -> Result<Arc<Self>> {
        Self::build(config, transports, monitor, None)
    }

    /// Build with an event store: events are appended (assigning their
    /// per-aggregate sequence) before fan-out and marked processed after.
    pub fn with_event_store(
        config: PublisherConfig,
        transports: Vec<Arc<dyn EventTransport>>,
        monitor: Arc<LatencyMonitor>,
        store: Arc<dyn EventStore>,
    ) -> Result<Arc<Self>> {
        Self::build(config, transports, monitor, Some(store))
    }

    fn build(
        config: PublisherConfig,
        transports: Vec<Arc<dyn EventTransport>>,
        monitor: Arc<LatencyMonitor>,
        store: Option<Arc<dyn EventStore>>,
    ) -> Result<Arc<Self>> {
        let config = config.validate()?;
        if transports.is_empty() {
            return Err(Error::Validation(
                "at least one transport is required".to_string(),
            ));
        }
        let mut transport_map: HashMap<TransportProtocol, Arc<dyn EventTransport>> =
            HashMap::new();
        for transport in transports {
            if transport_map
                .insert(transport.protocol(), transport)
                .is_some()
            {
                return Err(Error::Validation(
                    "duplicate transport protocol".to_string(),
                ));
            }
        }

        let (normal_tx, normal_rx) = mpsc::channel(config.event_queue_size);
        let (critical_tx, critical_rx) = mpsc::channel(config.critical_queue_size);
        let (shutdown_tx, _) = broadcast::channel(4);

        let backpressure = Arc::new(BackpressureController::new(BackpressureConfig {
            max_queue_depth: config.max_queue_depth,
            backpressure_delay: config.backpressure_delay,
            failure_threshold: config.failure_threshold,
            reset_timeout: config.reset_timeout,
            half_open_limit: config.half_open_limit,
        }));
        let dlq = Arc::new(DeadLetterQueue::new(DlqConfig {
            max_size: config.dlq_max_size,
            max_attempts: config.max_retries,
            retry_delay: config.retry_delay,
            retry_backoff: config.retry_backoff,
            retention: config.dlq_retention,
        }));

        let publisher = Arc::new(Self {
            router: Arc::new(SubscriptionRouter::new(config.router)),
            subscriptions: DashMap::new(),
            transports: transport_map,
            backpressure,
            dlq,
            ordering: config
                .ordering_enabled
                .then(|| Arc::new(OrderingBuffer::new(config.ordering_timeout))),
            dedup: config
                .dedup_enabled
                .then(|| Arc::new(Deduplicator::new(config.dedup_window))),
            store,
            metrics: Arc::new(PublisherMetrics::default()),
            monitor,
            normal_tx,
            critical_tx,
            normal_rx: Arc::new(tokio::sync::Mutex::new(normal_rx)),
            critical_rx: Arc::new(tokio::sync::Mutex::new(critical_rx)),
            seq_counters: DashMap::new(),
            last_hashes: DashMap::new(),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            config,
        });

        publisher.spawn_workers();
        Ok(publisher)
    }

    fn spawn_workers(self: &Arc<Self>) {
        let mut tasks = Vec::new();
        for _ in 0..self.config.worker_count {
            tasks.push(self.spawn_single_worker(QueueKind::Normal));
        }
        for _ in 0..self.config.critical_workers {
            tasks.push(self.spawn_single_worker(QueueKind::Critical));
        }
        if self.config.batch_worker_enabled {
            tasks.push(self.spawn_batch_worker());
        }
        if let Some(ordering) = &self.ordering {
            tasks.push(self.spawn_ordering_sweeper(Arc::clone(ordering)));
        }
        if let Some(dedup) = &self.dedup {
            tasks.push(self.spawn_dedup_sweeper(Arc::clone(dedup)));
        }
        let sink: Arc<dyn Redeliver> = Arc::new(EnqueueSink {
            normal_tx: self.normal_tx.clone(),
            critical_tx: self.critical_tx.clone(),
            metrics: Arc::clone(&self.metrics),
            backpressure: Arc::clone(&self.backpressure),
        });
        tasks.push(self.dlq.spawn_processor(
            sink,
            self.config.dlq_retry_interval,
            self.config.dlq_purge_interval,
            self.shutdown_tx.subscribe(),
        ));
        self.tasks.lock().extend(tasks);
    }

    fn spawn_single_worker(self: &Arc<Self>, queue: QueueKind) -> JoinHandle<()> {
        let publisher = Arc::clone(self);
        let rx = match queue {
            QueueKind::Normal => Arc::clone(&self.normal_rx),
            QueueKind::Critical => Arc::clone(&self.critical_rx),
        };
        tokio::spawn(async move {
            let mut shutdown = publisher.shutdown_tx.subscribe();
            loop {
                let maybe_event = {
                    let mut guard = rx.lock().await;
                    tokio::select! {
                        _ = shutdown.recv() => None,
                        event = guard.recv() => event,
                    }
                };
                let Some(event) = maybe_event else { break };
                publisher.note_dequeued(queue);
                publisher.deliver_single(event).await;
            }
        })
    }

    /// The batch worker drains the normal queue into micro-batches. It
    /// holds the queue lock only while collecting, then delivers with the
    /// lock released so the single-event workers can make progress.
    fn spawn_batch_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let publisher = Arc::clone(self);
        let rx = Arc::clone(&self.normal_rx);
        tokio::spawn(async move {
            let mut shutdown = publisher.shutdown_tx.subscribe();
            loop {
                let batch: Vec<AuditEvent> = {
                    let mut guard = rx.lock().await;
                    let first = tokio::select! {
                        _ = shutdown.recv() => None,
                        event = guard.recv() => event,
                    };
                    let Some(first) = first else { break };

                    let mut batch = Vec::with_capacity(publisher.config.batch_size);
                    batch.push(first);
                    let deadline = Instant::now() + publisher.config.batch_timeout;
                    while batch.len() < publisher.config.batch_size {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            break;
                        }
                        match tokio::time::timeout(remaining, guard.recv()).await {
                            Ok(Some(event)) => batch.push(event),
                            Ok(None) | Err(_) => break,
                        }
                    }
                    batch
                };

                for _ in &batch {
                    publisher.note_dequeued(QueueKind::Normal);
                }
                publisher.deliver_batch(batch).await;
            }
        })
    }

    fn spawn_ordering_sweeper(self: &Arc<Self>, ordering: Arc<OrderingBuffer>) -> JoinHandle<()> {
        let publisher = Arc::clone(self);
        let interval = (self.config.ordering_timeout / 2).max(std::time::Duration::from_millis(10));
        tokio::spawn(async move {
            let mut shutdown = publisher.shutdown_tx.subscribe();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        for event in ordering.flush_expired() {
                            if let Err(e) = publisher.enqueue(event) {
                                tracing::warn!(error = %e, "gap-released event could not be enqueued");
                            }
                        }
                    }
                }
            }
        })
    }

    fn spawn_dedup_sweeper(self: &Arc<Self>, dedup: Arc<Deduplicator>) -> JoinHandle<()> {
        let publisher = Arc::clone(self);
        let interval = self
            .config
            .dedup_window
            .min(std::time::Duration::from_secs(60))
            .max(std::time::Duration::from_millis(100));
        tokio::spawn(async move {
            let mut shutdown = publisher.shutdown_tx.subscribe();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        dedup.sweep();
                    }
                }
            }
        })
    }

    /// The stream transport reports stale connections on a removal
    /// channel; this task unsubscribes them. The task joins on `close`
    /// with the rest of the workers.
    pub fn spawn_removal_listener(self: &Arc<Self>, mut removals: mpsc::UnboundedReceiver<Uuid>) {
        let publisher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut shutdown = publisher.shutdown_tx.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    removed = removals.recv() => {
                        match removed {
                            Some(id) => {
                                if let Err(e) = publisher.unsubscribe(id) {
                                    tracing::debug!(subscription = %id, error = %e, "stale-connection unsubscribe");
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Ingest one event.
    ///
    /// Fails synchronously with `Validation`, `CircuitOpen`, `QueueFull`,
    /// or `Shutdown`; everything downstream is asynchronous and reported
    /// through metrics, per-subscription stats, and the dead-letter queue.
    pub async fn publish(&self, mut event: AuditEvent) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::Shutdown);
        }
        event.validate()?;

        if let Some(dedup) = &self.dedup {
            if !dedup.check_and_record(event.id) {
                self.metrics
                    .events_deduplicated
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }

        if let Some(store) = &self.store {
            event.sequence_num = store.append(&event).await?;
        } else if event.sequence_num == 0 {
            let counter = self
                .seq_counters
                .entry(event.aggregate_id.clone())
                .or_insert_with(|| AtomicU64::new(0));
            event.sequence_num = counter.fetch_add(1, Ordering::Relaxed) + 1;
        }

        if event.event_hash.is_empty() {
            let previous = self
                .last_hashes
                .get(&event.aggregate_id)
                .map(|h| h.clone())
                .unwrap_or_default();
            event = event.seal(&previous);
            self.last_hashes
                .insert(event.aggregate_id.clone(), event.event_hash.clone());
        }

        match self.backpressure.admit().await {
            Ok(()) => {}
            Err(Error::QueueFull(msg)) => {
                self.metrics
                    .events_dropped_queue_full
                    .fetch_add(1, Ordering::Relaxed);
                return Err(Error::QueueFull(msg));
            }
            Err(e) => return Err(e),
        }

        let releasable = match &self.ordering {
            Some(ordering) => ordering.offer(event),
            None => vec![event],
        };

        let mut result = Ok(());
        for event in releasable {
            if let Err(e) = self.enqueue(event) {
                result = Err(e);
            }
        }
        if result.is_err() {
            self.backpressure.record_failure();
        }
        result
    }

    fn enqueue(&self, event: AuditEvent) -> Result<()> {
        enqueue_event(
            &self.normal_tx,
            &self.critical_tx,
            &self.metrics,
            &self.backpressure,
            event,
        )
    }

    fn note_dequeued(&self, queue: QueueKind) {
        self.backpressure.note_dequeued();
        let gauge = match queue {
            QueueKind::Normal => &self.metrics.normal_queue_depth,
            QueueKind::Critical => &self.metrics.critical_queue_depth,
        };
        let _ = gauge.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| d.checked_sub(1));
    }

    /// Route an event, recovering router panics at the worker boundary.
    fn route_guarded(&self, event: &AuditEvent) -> Option<Vec<Uuid>> {
        match std::panic::catch_unwind(AssertUnwindSafe(|| self.router.route(event))) {
            Ok(matched) => Some(matched),
            Err(_) => {
                self.metrics.routing_panics.fetch_add(1, Ordering::Relaxed);
                self.metrics.events_failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(event_id = %event.id, "routing panicked, event counted failed");
                None
            }
        }
    }

    fn group_by_protocol(&self, matched: &[Uuid]) -> HashMap<TransportProtocol, Vec<Uuid>> {
        let mut groups: HashMap<TransportProtocol, Vec<Uuid>> = HashMap::new();
        for id in matched {
            if let Some(entry) = self.subscriptions.get(id) {
                groups.entry(entry.meta.protocol).or_default().push(*id);
            }
            // Unsubscribed between routing and here: skip silently.
        }
        groups
    }

    async fn send_to_transport(
        &self,
        protocol: TransportProtocol,
        events: &[AuditEvent],
        ids: &[Uuid],
        batched: bool,
    ) -> Result<()> {
        let transport = self
            .transports
            .get(&protocol)
            .ok_or_else(|| Error::NotFound(format!("transport {}", protocol.as_str())))?;
        let send = async {
            if batched {
                transport.send_batch(events, ids).await
            } else {
                transport.send(&events[0], ids).await
            }
        };
        match tokio::time::timeout(self.config.send_timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{} send exceeded {:?}",
                protocol.as_str(),
                self.config.send_timeout
            ))),
        }
    }

    fn note_group_outcome(&self, ids: &[Uuid], elapsed_us: u64, success: bool) {
        for id in ids {
            if let Some(entry) = self.subscriptions.get(id) {
                let mut stats = entry.stats.lock();
                if success {
                    stats.note_success(elapsed_us);
                } else {
                    stats.note_failure();
                }
            }
        }
    }

    async fn deliver_single(&self, event: AuditEvent) {
        let Some(matched) = self.route_guarded(&event) else {
            return;
        };
        let groups = self.group_by_protocol(&matched);

        let mut any_failure = false;
        let mut retryable_failure: Option<&'static str> = None;
        for (protocol, ids) in &groups {
            let started = Instant::now();
            let events = std::slice::from_ref(&event);
            match self.send_to_transport(*protocol, events, ids, false).await {
                Ok(()) => {
                    let elapsed = started.elapsed();
                    self.metrics.transport_sends.fetch_add(1, Ordering::Relaxed);
                    self.note_group_outcome(
                        ids,
                        u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
                        true,
                    );
                    self.monitor
                        .record_latency(DELIVERY_OPERATION, elapsed, false);
                }
                Err(e) => {
                    any_failure = true;
                    self.metrics
                        .transport_failures
                        .fetch_add(1, Ordering::Relaxed);
                    self.note_group_outcome(ids, 0, false);
                    if e.is_retryable() {
                        retryable_failure = Some(e.reason());
                    }
                    tracing::warn!(
                        event_id = %event.id,
                        transport = protocol.as_str(),
                        error = %e,
                        "delivery failed"
                    );
                }
            }
        }

        if any_failure {
            self.metrics.events_failed.fetch_add(1, Ordering::Relaxed);
            if let Some(reason) = retryable_failure {
                self.dlq.add(event, reason).await;
            }
        } else {
            self.metrics
                .events_published
                .fetch_add(1, Ordering::Relaxed);
            self.mark_processed(event.id).await;
        }
    }

    /// Exactly-once bookkeeping: record that every transport accepted the
    /// event. Best-effort; a failed mark leaves the event eligible for
    /// catch-up replay, never double-fails delivery.
    async fn mark_processed(&self, event_id: Uuid) {
        if let Some(store) = &self.store {
            if let Err(e) = store.mark_processed(event_id).await {
                tracing::warn!(event_id = %event_id, error = %e, "mark_processed failed");
            }
        }
    }

    async fn deliver_batch(&self, events: Vec<AuditEvent>) {
        if events.is_empty() {
            return;
        }
        self.metrics.batches_flushed.fetch_add(1, Ordering::Relaxed);

        // Group events by transport and exact subscriber set so nobody
        // receives an event their filter did not match.
        type GroupKey = (TransportProtocol, Vec<Uuid>);
        let mut groups: HashMap<GroupKey, Vec<AuditEvent>> = HashMap::new();
        let mut failed: HashMap<Uuid, bool> = HashMap::new();
        let mut routed_events = 0u64;

        for event in events {
            let Some(matched) = self.route_guarded(&event) else {
                continue;
            };
            routed_events += 1;
            failed.insert(event.id, false);
            for (protocol, ids) in self.group_by_protocol(&matched) {
                groups.entry((protocol, ids)).or_default().push(event.clone());
            }
        }

        for ((protocol, ids), group_events) in &groups {
            let started = Instant::now();
            match self
                .send_to_transport(*protocol, group_events, ids, true)
                .await
            {
                Ok(()) => {
                    let elapsed = started.elapsed();
                    self.metrics.transport_sends.fetch_add(1, Ordering::Relaxed);
                    self.note_group_outcome(
                        ids,
                        u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
                        true,
                    );
                    self.monitor
                        .record_latency(DELIVERY_OPERATION, elapsed, false);
                }
                Err(e) => {
                    self.metrics
                        .transport_failures
                        .fetch_add(1, Ordering::Relaxed);
                    self.note_group_outcome(ids, 0, false);
                    let retryable = e.is_retryable();
                    for event in group_events {
                        failed.insert(event.id, true);
                        if retryable {
                            self.dlq.add(event.clone(), e.reason()).await;
                        }
                    }
                    tracing::warn!(
                        transport = protocol.as_str(),
                        batch = group_events.len(),
                        error = %e,
                        "batch delivery failed"
                    );
                }
            }
        }

        let failed_count = failed.values().filter(|f| **f).count() as u64;
        self.metrics
            .events_failed
            .fetch_add(failed_count, Ordering::Relaxed);
        self.metrics
            .events_published
            .fetch_add(routed_events - failed_count, Ordering::Relaxed);
        for (event_id, event_failed) in &failed {
            if !event_failed {
                self.mark_processed(*event_id).await;
            }
        }
    }

    /// Register a subscription. Stream connections and webhook endpoints
    /// are attached on their transports under the returned subscription id.
    pub fn subscribe(
        &self,
        user_id: &str,
        protocol: TransportProtocol,
        filter: SubscriptionFilter,
    ) -> Result<Subscription> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::Shutdown);
        }
        if !self.transports.contains_key(&protocol) {
            return Err(Error::Validation(format!(
                "no transport registered for {}",
                protocol.as_str()
            )));
        }
        let subscription = Subscription {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            protocol,
            filter: filter.clone(),
            created_at: Utc::now(),
        };
        self.subscriptions.insert(
            subscription.id,
            SubscriptionEntry {
                meta: subscription.clone(),
                stats: Mutex::new(DeliveryStats::default()),
            },
        );
        self.router.register(subscription.id, filter);
        Ok(subscription)
    }

    pub fn unsubscribe(&self, id: Uuid) -> Result<()> {
        if self.subscriptions.remove(&id).is_none() {
            return Err(Error::NotFound(format!("subscription {id}")));
        }
        self.router.unregister(id);
        Ok(())
    }

    pub fn subscription_stats(&self, id: Uuid) -> Option<DeliveryStats> {
        self.subscriptions.get(&id).map(|e| e.stats.lock().clone())
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn metrics(&self) -> PublisherMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn metrics_handle(&self) -> Arc<PublisherMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn dlq(&self) -> Arc<DeadLetterQueue> {
        Arc::clone(&self.dlq)
    }

    pub fn backpressure(&self) -> Arc<BackpressureController> {
        Arc::clone(&self.backpressure)
    }

    pub fn router(&self) -> Arc<SubscriptionRouter> {
        Arc::clone(&self.router)
    }

    /// Manually retry one dead-letter entry through the ingress queues.
    pub async fn retry_failed(&self, event_id: Uuid) -> Result<()> {
        let sink = EnqueueSink {
            normal_tx: self.normal_tx.clone(),
            critical_tx: self.critical_tx.clone(),
            metrics: Arc::clone(&self.metrics),
            backpressure: Arc::clone(&self.backpressure),
        };
        self.dlq.retry(event_id, &sink).await
    }

    pub fn health(&self) -> HealthStatus {
        let mut reasons = Vec::new();
        if self.closed.load(Ordering::Relaxed) {
            reasons.push("publisher shut down".to_string());
        }
        for (protocol, transport) in &self.transports {
            if !transport.is_healthy() {
                reasons.push(format!("transport {} unhealthy", protocol.as_str()));
            }
        }
        let normal_utilization = self.metrics.normal_queue_depth.load(Ordering::Relaxed) as f64
            / self.config.event_queue_size as f64;
        let critical_utilization = self.metrics.critical_queue_depth.load(Ordering::Relaxed)
            as f64
            / self.config.critical_queue_size as f64;
        if normal_utilization > 0.9 {
            reasons.push(format!(
                "normal queue {:.0}% full",
                normal_utilization * 100.0
            ));
        }
        if critical_utilization > 0.9 {
            reasons.push(format!(
                "critical queue {:.0}% full",
                critical_utilization * 100.0
            ));
        }
        HealthStatus {
            healthy: reasons.is_empty(),
            reasons,
            normal_queue_utilization: normal_utilization,
            critical_queue_utilization: critical_utilization,
        }
    }

    /// Shut down: stop workers, drain within `shutdown_timeout`, count
    /// still-queued events as dropped, close every transport. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let drain = futures::future::join_all(tasks);
        if tokio::time::timeout(self.config.shutdown_timeout, drain)
            .await
            .is_err()
        {
            tracing::warn!(
                timeout = ?self.config.shutdown_timeout,
                "workers did not drain before shutdown timeout"
            );
        }

        // Anything still queued is lost and counted.
        for rx in [&self.normal_rx, &self.critical_rx] {
            if let Ok(mut guard) = rx.try_lock() {
                while guard.try_recv().is_ok() {
                    self.metrics
                        .events_dropped_shutdown
                        .fetch_add(1, Ordering::Relaxed);
                    self.backpressure.note_dequeued();
                }
            }
        }

        for transport in self.transports.values() {
            transport.close().await;
        }
        Ok(())
    }
}
