// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The latency monitor: bounded measurement buffer, periodic flush into
//! percentile trackers, snapshot statistics, SLA scoring, and alerting.
//!
//! `record_latency` is designed for hot paths: it takes two short
//! `parking_lot` locks and never awaits. The flush task does the heavier
//! percentile work off the caller's path. When the buffer fills between
//! flushes, the recording caller flushes inline rather than dropping
//! measurements.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use prometheus::core::{Collector, Desc};
use prometheus::proto::{
    Counter as ProtoCounter, Gauge as ProtoGauge, Metric as ProtoMetric, MetricFamily, MetricType,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::alerts::{Alert, AlertKind, AlertManager, AlertSeverity};
use crate::degradation::{DegradationConfig, DegradationDetector, DegradationReport};
use crate::percentile::PercentileTracker;
use crate::sla::{SlaCompliance, SlaThresholds, SlaViolation, ViolationKind};

/// Monitor tuning. Defaults fit the DNC lookup path; the publisher uses the
/// same defaults with a larger buffer.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Measurements buffered between flushes. A full buffer flushes inline.
    pub buffer_size: usize,
    /// How often the background task flushes the buffer.
    pub flush_interval: Duration,
    /// How long SLA violations are retained for inspection.
    pub retention_period: Duration,
    /// Sliding-window capacity of each percentile tracker.
    pub percentile_window: usize,
    /// Initial SLA thresholds; adjustable at runtime.
    pub sla: SlaThresholds,
    /// Degradation detector tuning.
    pub degradation: DegradationConfig,
    /// Per-kind alert cooldown.
    pub alert_cooldown: Duration,
    /// Broadcast backlog for alert subscribers.
    pub alert_capacity: usize,
    /// Rolling compliance below this percentage raises an alert.
    pub compliance_alert_floor: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            flush_interval: Duration::from_secs(1),
            retention_period: Duration::from_secs(3600),
            percentile_window: 8192,
            sla: SlaThresholds::default(),
            degradation: DegradationConfig::default(),
            alert_cooldown: Duration::from_secs(60),
            alert_capacity: 64,
            compliance_alert_floor: 95.0,
        }
    }
}

/// One buffered measurement.
#[derive(Debug, Clone)]
struct Measurement {
    operation: String,
    duration: Duration,
    cache_hit: bool,
}

/// Percentiles for one side of the cache-hit split.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SideStats {
    pub count: usize,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
}

/// Snapshot statistics recomputed at every flush.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyStats {
    /// Cumulative measurements ever recorded.
    pub count: u64,
    /// Samples currently in the percentile window.
    pub window_len: usize,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub p999_us: u64,
    pub mean_us: u64,
    pub min_us: u64,
    pub max_us: u64,
    /// Measurements per second over the last flush window.
    pub throughput_per_sec: f64,
    pub cache_hit: Option<SideStats>,
    pub cache_miss: Option<SideStats>,
}

struct TrackerSet {
    overall: PercentileTracker,
    hits: PercentileTracker,
    misses: PercentileTracker,
}

/// Trend direction over a recent sample window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrendDirection {
    Improving,
    Stable,
    Degrading,
}

/// Result of [`LatencyMonitor::performance_trend`].
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceTrend {
    pub slope_us_per_sample: f64,
    pub direction: TrendDirection,
    pub window: usize,
}

/// Latency monitor shared by the DNC accelerator and the event publisher.
pub struct LatencyMonitor {
    config: MonitorConfig,
    buffer: Mutex<Vec<Measurement>>,
    trackers: Mutex<TrackerSet>,
    snapshot: RwLock<LatencyStats>,
    thresholds: RwLock<SlaThresholds>,
    violations: Mutex<VecDeque<SlaViolation>>,
    violations_total: AtomicU64,
    recorded_total: AtomicU64,
    last_flush: Mutex<Instant>,
    degradation: Mutex<DegradationDetector>,
    alerts: AlertManager,
}

impl LatencyMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let window = config.percentile_window;
        Self {
            buffer: Mutex::new(Vec::with_capacity(config.buffer_size.max(1))),
            trackers: Mutex::new(TrackerSet {
                overall: PercentileTracker::new(window),
                hits: PercentileTracker::new(window),
                misses: PercentileTracker::new(window),
            }),
            snapshot: RwLock::new(LatencyStats::default()),
            thresholds: RwLock::new(config.sla),
            violations: Mutex::new(VecDeque::new()),
            violations_total: AtomicU64::new(0),
            recorded_total: AtomicU64::new(0),
            last_flush: Mutex::new(Instant::now()),
            degradation: Mutex::new(DegradationDetector::new(config.degradation)),
            alerts: AlertManager::new(config.alert_cooldown, config.alert_capacity),
            config,
        }
    }

    /// Record one operation latency. Non-blocking; a full buffer triggers an
    /// inline flush.
    pub fn record_latency(&self, operation: &str, duration: Duration, cache_hit: bool) {
        self.recorded_total.fetch_add(1, Ordering::Relaxed);

        // Per-call SLA check against the p99 target.
        let p99_threshold = self.thresholds.read().p99;
        if duration > p99_threshold {
            let violation = SlaViolation::latency(
                ViolationKind::PerCallLatency,
                operation,
                duration,
                p99_threshold,
                cache_hit,
            );
            let severity = match violation.severity {
                crate::sla::ViolationSeverity::Critical => AlertSeverity::Critical,
                crate::sla::ViolationSeverity::Warning => AlertSeverity::Warning,
            };
            self.push_violation(violation);
            self.alerts.fire(Alert::new(
                AlertKind::SlaViolation,
                severity,
                format!(
                    "{} took {}us, p99 target {}us",
                    operation,
                    duration.as_micros(),
                    p99_threshold.as_micros()
                ),
            ));
        }

        let should_flush = {
            let mut buffer = self.buffer.lock();
            buffer.push(Measurement {
                operation: operation.to_string(),
                duration,
                cache_hit,
            });
            buffer.len() >= self.config.buffer_size
        };
        if should_flush {
            self.flush();
        }
    }

    /// Drain the buffer into the trackers and recompute the snapshot.
    ///
    /// Normally driven by [`spawn_flush_task`](Self::spawn_flush_task);
    /// public so tests and shutdown paths can force a flush.
    pub fn flush(&self) {
        let drained: Vec<Measurement> = {
            let mut buffer = self.buffer.lock();
            if buffer.is_empty() {
                return;
            }
            std::mem::take(&mut *buffer)
        };

        let elapsed = {
            let mut last = self.last_flush.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let stats = {
            let mut trackers = self.trackers.lock();
            let mut degradation = self.degradation.lock();
            for m in &drained {
                trackers.overall.record(m.duration);
                if m.cache_hit {
                    trackers.hits.record(m.duration);
                } else {
                    trackers.misses.record(m.duration);
                }
                degradation.ingest(m.duration);
            }
            self.build_snapshot(&trackers, drained.len(), elapsed)
        };

        *self.snapshot.write() = stats.clone();

        self.evaluate_rolling_sla(&stats);
        self.evaluate_degradation(&stats);
    }

    fn build_snapshot(
        &self,
        trackers: &TrackerSet,
        drained: usize,
        elapsed: Duration,
    ) -> LatencyStats {
        let q = |t: &PercentileTracker, q: f64| -> u64 {
            t.quantile(q)
                .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
                .unwrap_or(0)
        };
        let side = |t: &PercentileTracker| -> Option<SideStats> {
            if t.is_empty() {
                None
            } else {
                Some(SideStats {
                    count: t.len(),
                    p50_us: q(t, 0.50),
                    p95_us: q(t, 0.95),
                    p99_us: q(t, 0.99),
                })
            }
        };
        // Avoid a throughput spike from a near-zero window.
        let window_secs = elapsed.as_secs_f64().max(0.001);
        LatencyStats {
            count: self.recorded_total.load(Ordering::Relaxed),
            window_len: trackers.overall.len(),
            p50_us: q(&trackers.overall, 0.50),
            p95_us: q(&trackers.overall, 0.95),
            p99_us: q(&trackers.overall, 0.99),
            p999_us: q(&trackers.overall, 0.999),
            mean_us: trackers
                .overall
                .mean()
                .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
                .unwrap_or(0),
            min_us: trackers
                .overall
                .min()
                .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
                .unwrap_or(0),
            max_us: trackers
                .overall
                .max()
                .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
                .unwrap_or(0),
            throughput_per_sec: drained as f64 / window_secs,
            cache_hit: side(&trackers.hits),
            cache_miss: side(&trackers.misses),
        }
    }

    fn evaluate_rolling_sla(&self, stats: &LatencyStats) {
        let thresholds = *self.thresholds.read();
        let rolling = [
            (ViolationKind::LatencyP50, stats.p50_us, thresholds.p50),
            (ViolationKind::LatencyP95, stats.p95_us, thresholds.p95),
            (ViolationKind::LatencyP99, stats.p99_us, thresholds.p99),
        ];
        for (kind, observed_us, threshold) in rolling {
            if observed_us > u64::try_from(threshold.as_micros()).unwrap_or(u64::MAX) {
                self.push_violation(SlaViolation::latency(
                    kind,
                    "rolling",
                    Duration::from_micros(observed_us),
                    threshold,
                    false,
                ));
            }
        }

        let compliance = SlaCompliance::score(
            &thresholds,
            stats.p50_us,
            stats.p95_us,
            stats.p99_us,
            stats.throughput_per_sec,
        );
        if stats.count > 0 && compliance.overall < self.config.compliance_alert_floor {
            self.alerts.fire(Alert::new(
                AlertKind::ComplianceLow,
                AlertSeverity::Warning,
                format!(
                    "rolling SLA compliance {:.1}% below {:.1}% floor",
                    compliance.overall, self.config.compliance_alert_floor
                ),
            ));
        }
    }

    fn evaluate_degradation(&self, stats: &LatencyStats) {
        let report = {
            let degradation = self.degradation.lock();
            degradation.assess(Duration::from_micros(stats.p99_us))
        };
        if let Some(report) = report {
            if report.degraded {
                self.alerts.fire(Alert::new(
                    AlertKind::Degradation,
                    AlertSeverity::Critical,
                    format!(
                        "p99 {}us is {:.2}x the {}us baseline (confidence {:.2})",
                        report.current_p99_us,
                        report.factor,
                        report.baseline.p99_us,
                        report.confidence
                    ),
                ));
            }
        }
    }

    fn push_violation(&self, violation: SlaViolation) {
        self.violations_total.fetch_add(1, Ordering::Relaxed);
        let retention = chrono::Duration::from_std(self.config.retention_period)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let cutoff = chrono::Utc::now() - retention;
        let mut violations = self.violations.lock();
        while violations
            .front()
            .map(|v| v.timestamp < cutoff)
            .unwrap_or(false)
        {
            violations.pop_front();
        }
        violations.push_back(violation);
    }

    /// Spawn the periodic flush task. Flushes once more on shutdown.
    pub fn spawn_flush_task(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(monitor.config.flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        monitor.flush();
                        break;
                    }
                    _ = interval.tick() => {
                        monitor.flush();
                    }
                }
            }
        })
    }

    /// Last flushed snapshot.
    pub fn current_stats(&self) -> LatencyStats {
        self.snapshot.read().clone()
    }

    /// Compliance of the last snapshot against the live thresholds.
    pub fn sla_compliance(&self) -> SlaCompliance {
        let stats = self.snapshot.read();
        let thresholds = self.thresholds.read();
        SlaCompliance::score(
            &thresholds,
            stats.p50_us,
            stats.p95_us,
            stats.p99_us,
            stats.throughput_per_sec,
        )
    }

    /// Trend over the last `window` samples.
    pub fn performance_trend(&self, window: usize) -> PerformanceTrend {
        let slope = self.degradation.lock().trend_slope_over(window);
        // A slope inside +-1us/sample is measurement noise.
        let direction = if slope > 1.0 {
            TrendDirection::Degrading
        } else if slope < -1.0 {
            TrendDirection::Improving
        } else {
            TrendDirection::Stable
        };
        PerformanceTrend {
            slope_us_per_sample: slope,
            direction,
            window,
        }
    }

    /// Replace the SLA thresholds at runtime.
    pub fn set_sla_thresholds(&self, thresholds: SlaThresholds) {
        *self.thresholds.write() = thresholds;
    }

    /// Degradation report against the current snapshot, if a baseline exists.
    pub fn degradation_report(&self) -> Option<DegradationReport> {
        let p99 = Duration::from_micros(self.snapshot.read().p99_us);
        self.degradation.lock().assess(p99)
    }

    /// Retained violations, oldest first.
    pub fn violations(&self) -> Vec<SlaViolation> {
        self.violations.lock().iter().cloned().collect()
    }

    /// Total violations recorded since startup (not bounded by retention).
    pub fn sla_violations_total(&self) -> u64 {
        self.violations_total.load(Ordering::Relaxed)
    }

    /// Subscribe to alerts.
    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    /// Alert manager counters, for health surfaces.
    pub fn alerts_fired_total(&self) -> u64 {
        self.alerts.fired_total()
    }
}

// =============================================================================
// Prometheus bridge
// =============================================================================

/// Prometheus collector over the monitor's atomics and snapshot.
///
/// Scrapes read the last flushed snapshot; no locks beyond the snapshot
/// RwLock are taken at collect time.
pub struct MonitorCollector {
    monitor: Arc<LatencyMonitor>,
    descs: Vec<Desc>,
}

impl MonitorCollector {
    pub fn new(monitor: Arc<LatencyMonitor>) -> Self {
        let descs = vec![
            Desc::new(
                "switchboard_sla_violations_total".to_string(),
                "Total SLA violations recorded".to_string(),
                Vec::new(),
                std::collections::HashMap::new(),
            )
            .expect("valid switchboard_sla_violations_total desc"),
            Desc::new(
                "switchboard_latency_p99_seconds".to_string(),
                "p99 latency from the last flush".to_string(),
                Vec::new(),
                std::collections::HashMap::new(),
            )
            .expect("valid switchboard_latency_p99_seconds desc"),
            Desc::new(
                "switchboard_latency_p50_seconds".to_string(),
                "p50 latency from the last flush".to_string(),
                Vec::new(),
                std::collections::HashMap::new(),
            )
            .expect("valid switchboard_latency_p50_seconds desc"),
            Desc::new(
                "switchboard_latency_throughput_per_sec".to_string(),
                "Measurements per second over the last flush window".to_string(),
                Vec::new(),
                std::collections::HashMap::new(),
            )
            .expect("valid switchboard_latency_throughput_per_sec desc"),
            Desc::new(
                "switchboard_alerts_fired_total".to_string(),
                "Total telemetry alerts dispatched".to_string(),
                Vec::new(),
                std::collections::HashMap::new(),
            )
            .expect("valid switchboard_alerts_fired_total desc"),
        ];
        Self { monitor, descs }
    }

    fn counter_family(name: &str, help: &str, value: u64) -> MetricFamily {
        let mut family = MetricFamily::default();
        family.set_name(name.to_string());
        family.set_help(help.to_string());
        family.set_field_type(MetricType::COUNTER);
        let mut metric = ProtoMetric::default();
        let mut counter = ProtoCounter::default();
        counter.set_value(value as f64);
        metric.set_counter(counter);
        family.mut_metric().push(metric);
        family
    }

    fn gauge_family(name: &str, help: &str, value: f64) -> MetricFamily {
        let mut family = MetricFamily::default();
        family.set_name(name.to_string());
        family.set_help(help.to_string());
        family.set_field_type(MetricType::GAUGE);
        let mut metric = ProtoMetric::default();
        let mut gauge = ProtoGauge::default();
        gauge.set_value(value);
        metric.set_gauge(gauge);
        family.mut_metric().push(metric);
        family
    }
}

impl Collector for MonitorCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let stats = self.monitor.current_stats();
        vec![
            Self::counter_family(
                "switchboard_sla_violations_total",
                "Total SLA violations recorded",
                self.monitor.sla_violations_total(),
            ),
            Self::gauge_family(
                "switchboard_latency_p99_seconds",
                "p99 latency from the last flush",
                stats.p99_us as f64 / 1e6,
            ),
            Self::gauge_family(
                "switchboard_latency_p50_seconds",
                "p50 latency from the last flush",
                stats.p50_us as f64 / 1e6,
            ),
            Self::gauge_family(
                "switchboard_latency_throughput_per_sec",
                "Measurements per second over the last flush window",
                stats.throughput_per_sec,
            ),
            Self::counter_family(
                "switchboard_alerts_fired_total",
                "Total telemetry alerts dispatched",
                self.monitor.alerts_fired_total(),
            ),
        ]
    }
}
