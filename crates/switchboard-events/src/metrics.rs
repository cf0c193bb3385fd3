// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Publisher metrics: atomic counters owned by the publisher, bridged to
//! Prometheus through a custom collector at scrape time.
//!
//! `/metrics` handlers gather only from the registry; this collector is the
//! bridge between the hot-path atomics and Prometheus metric families, so
//! delivery paths never touch a Prometheus type.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use prometheus::core::{Collector, Desc};
use prometheus::proto::{
    Counter as ProtoCounter, Gauge as ProtoGauge, LabelPair, Metric as ProtoMetric, MetricFamily,
    MetricType,
};
use serde::Serialize;

use crate::backpressure::{BackpressureController, CircuitState};
use crate::dlq::DeadLetterQueue;

/// Hot-path counters. All relaxed atomics; snapshots are advisory.
#[derive(Debug)]
pub struct PublisherMetrics {
    pub events_published: AtomicU64,
    pub events_failed: AtomicU64,
    pub events_dropped_queue_full: AtomicU64,
    pub events_dropped_shutdown: AtomicU64,
    pub events_deduplicated: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub transport_sends: AtomicU64,
    pub transport_failures: AtomicU64,
    pub routing_panics: AtomicU64,
    pub normal_queue_depth: AtomicUsize,
    pub critical_queue_depth: AtomicUsize,
    pub started_at: Instant,
}

impl Default for PublisherMetrics {
    fn default() -> Self {
        Self {
            events_published: AtomicU64::new(0),
            events_failed: AtomicU64::new(0),
            events_dropped_queue_full: AtomicU64::new(0),
            events_dropped_shutdown: AtomicU64::new(0),
            events_deduplicated: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            transport_sends: AtomicU64::new(0),
            transport_failures: AtomicU64::new(0),
            routing_panics: AtomicU64::new(0),
            normal_queue_depth: AtomicUsize::new(0),
            critical_queue_depth: AtomicUsize::new(0),
            started_at: Instant::now(),
        }
    }
}

/// Serializable snapshot for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct PublisherMetricsSnapshot {
    pub events_published: u64,
    pub events_failed: u64,
    pub events_dropped: u64,
    pub events_dropped_queue_full: u64,
    pub events_dropped_shutdown: u64,
    pub events_deduplicated: u64,
    pub batches_flushed: u64,
    pub transport_sends: u64,
    pub transport_failures: u64,
    pub routing_panics: u64,
    pub normal_queue_depth: usize,
    pub critical_queue_depth: usize,
    pub uptime_seconds: u64,
}

impl PublisherMetrics {
    /// Total drops across all reasons. Deduplicated events count as drops
    /// so `published + failed + dropped` accounts for every accepted
    /// publish once the system drains.
    pub fn events_dropped(&self) -> u64 {
        self.events_dropped_queue_full.load(Ordering::Relaxed)
            + self.events_dropped_shutdown.load(Ordering::Relaxed)
            + self.events_deduplicated.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PublisherMetricsSnapshot {
        PublisherMetricsSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_failed: self.events_failed.load(Ordering::Relaxed),
            events_dropped: self.events_dropped(),
            events_dropped_queue_full: self.events_dropped_queue_full.load(Ordering::Relaxed),
            events_dropped_shutdown: self.events_dropped_shutdown.load(Ordering::Relaxed),
            events_deduplicated: self.events_deduplicated.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            transport_sends: self.transport_sends.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            routing_panics: self.routing_panics.load(Ordering::Relaxed),
            normal_queue_depth: self.normal_queue_depth.load(Ordering::Relaxed),
            critical_queue_depth: self.critical_queue_depth.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Prometheus collector over the publisher's atomics, the DLQ size, and
/// the circuit state.
pub struct PublisherMetricsCollector {
    metrics: Arc<PublisherMetrics>,
    dlq: Arc<DeadLetterQueue>,
    backpressure: Arc<BackpressureController>,
    descs: Vec<Desc>,
}

impl PublisherMetricsCollector {
    pub fn new(
        metrics: Arc<PublisherMetrics>,
        dlq: Arc<DeadLetterQueue>,
        backpressure: Arc<BackpressureController>,
    ) -> Self {
        let desc = |name: &str, help: &str, labels: Vec<String>| {
            Desc::new(name.to_string(), help.to_string(), labels, HashMap::new())
                .expect("valid metric desc")
        };
        let descs = vec![
            desc(
                "switchboard_events_published_total",
                "Events delivered to every matching transport",
                Vec::new(),
            ),
            desc(
                "switchboard_events_failed_total",
                "Events that failed at least one transport",
                Vec::new(),
            ),
            desc(
                "switchboard_events_dropped_total",
                "Events dropped before delivery",
                vec!["reason".to_string()],
            ),
            desc(
                "switchboard_queue_depth",
                "Current ingress queue depth",
                vec!["queue".to_string()],
            ),
            desc(
                "switchboard_dlq_size",
                "Entries waiting in the dead-letter queue",
                Vec::new(),
            ),
            desc(
                "switchboard_circuit_state",
                "Circuit breaker state (0=closed, 1=half-open, 2=open)",
                Vec::new(),
            ),
            desc(
                "switchboard_transport_sends_total",
                "Transport send calls",
                vec!["outcome".to_string()],
            ),
        ];
        Self {
            metrics,
            dlq,
            backpressure,
            descs,
        }
    }

    fn label(name: &str, value: &str) -> LabelPair {
        let mut lp = LabelPair::default();
        lp.set_name(name.to_string());
        lp.set_value(value.to_string());
        lp
    }

    fn counter_family(name: &str, help: &str, series: Vec<(Vec<LabelPair>, u64)>) -> MetricFamily {
        let mut family = MetricFamily::default();
        family.set_name(name.to_string());
        family.set_help(help.to_string());
        family.set_field_type(MetricType::COUNTER);
        for (labels, value) in series {
            let mut metric = ProtoMetric::default();
            metric.set_label(labels.into());
            let mut counter = ProtoCounter::default();
            counter.set_value(value as f64);
            metric.set_counter(counter);
            family.mut_metric().push(metric);
        }
        family
    }

    fn gauge_family(name: &str, help: &str, series: Vec<(Vec<LabelPair>, f64)>) -> MetricFamily {
        let mut family = MetricFamily::default();
        family.set_name(name.to_string());
        family.set_help(help.to_string());
        family.set_field_type(MetricType::GAUGE);
        for (labels, value) in series {
            let mut metric = ProtoMetric::default();
            metric.set_label(labels.into());
            let mut gauge = ProtoGauge::default();
            gauge.set_value(value);
            metric.set_gauge(gauge);
            family.mut_metric().push(metric);
        }
        family
    }
}

impl Collector for PublisherMetricsCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let m = &self.metrics;
        let circuit_value = match self.backpressure.state() {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        };
        vec![
            Self::counter_family(
                "switchboard_events_published_total",
                "Events delivered to every matching transport",
                vec![(Vec::new(), m.events_published.load(Ordering::Relaxed))],
            ),
            Self::counter_family(
                "switchboard_events_failed_total",
                "Events that failed at least one transport",
                vec![(Vec::new(), m.events_failed.load(Ordering::Relaxed))],
            ),
            Self::counter_family(
                "switchboard_events_dropped_total",
                "Events dropped before delivery",
                vec![
                    (
                        vec![Self::label("reason", "queue_full")],
                        m.events_dropped_queue_full.load(Ordering::Relaxed),
                    ),
                    (
                        vec![Self::label("reason", "shutdown")],
                        m.events_dropped_shutdown.load(Ordering::Relaxed),
                    ),
                    (
                        vec![Self::label("reason", "duplicate")],
                        m.events_deduplicated.load(Ordering::Relaxed),
                    ),
                ],
            ),
            Self::gauge_family(
                "switchboard_queue_depth",
                "Current ingress queue depth",
                vec![
                    (
                        vec![Self::label("queue", "normal")],
                        m.normal_queue_depth.load(Ordering::Relaxed) as f64,
                    ),
                    (
                        vec![Self::label("queue", "critical")],
                        m.critical_queue_depth.load(Ordering::Relaxed) as f64,
                    ),
                ],
            ),
            Self::gauge_family(
                "switchboard_dlq_size",
                "Entries waiting in the dead-letter queue",
                vec![(Vec::new(), self.dlq.stats_sync().size as f64)],
            ),
            Self::gauge_family(
                "switchboard_circuit_state",
                "Circuit breaker state (0=closed, 1=half-open, 2=open)",
                vec![(Vec::new(), circuit_value)],
            ),
            Self::counter_family(
                "switchboard_transport_sends_total",
                "Transport send calls",
                vec![
                    (
                        vec![Self::label("outcome", "success")],
                        m.transport_sends.load(Ordering::Relaxed),
                    ),
                    (
                        vec![Self::label("outcome", "failure")],
                        m.transport_failures.load(Ordering::Relaxed),
                    ),
                ],
            ),
        ]
    }
}
