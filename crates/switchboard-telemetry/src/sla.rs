// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! SLA thresholds, compliance scoring, and violation records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Latency and throughput targets the monitor scores against.
#[derive(Debug, Clone, Copy)]
pub struct SlaThresholds {
    /// Target p50 latency.
    pub p50: Duration,
    /// Target p95 latency.
    pub p95: Duration,
    /// Target p99 latency.
    pub p99: Duration,
    /// Minimum acceptable throughput in measurements per second.
    pub min_throughput: f64,
}

impl Default for SlaThresholds {
    fn default() -> Self {
        // Sub-millisecond DNC budget: p50 under 2ms, tail under 10ms.
        Self {
            p50: Duration::from_millis(2),
            p95: Duration::from_millis(5),
            p99: Duration::from_millis(10),
            min_throughput: 100.0,
        }
    }
}

/// Compliance percentages per dimension plus the weighted overall score.
///
/// Per-percentile compliance is `min(100, threshold / observed * 100)`;
/// throughput compliance is `min(100, observed / min_throughput * 100)`.
/// Overall is weighted `0.2*p50 + 0.3*p95 + 0.4*p99 + 0.1*throughput`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SlaCompliance {
    pub p50_compliance: f64,
    pub p95_compliance: f64,
    pub p99_compliance: f64,
    pub throughput_compliance: f64,
    pub overall: f64,
}

impl SlaCompliance {
    /// Score observed latencies (microseconds) and throughput against the
    /// thresholds. Dimensions with no observation yet score 100.
    pub fn score(
        thresholds: &SlaThresholds,
        p50_us: u64,
        p95_us: u64,
        p99_us: u64,
        throughput_per_sec: f64,
    ) -> Self {
        let latency = |threshold: Duration, observed_us: u64| -> f64 {
            if observed_us == 0 {
                return 100.0;
            }
            let threshold_us = threshold.as_micros() as f64;
            (threshold_us / observed_us as f64 * 100.0).min(100.0)
        };
        let p50_compliance = latency(thresholds.p50, p50_us);
        let p95_compliance = latency(thresholds.p95, p95_us);
        let p99_compliance = latency(thresholds.p99, p99_us);
        let throughput_compliance = if thresholds.min_throughput <= 0.0 {
            100.0
        } else {
            (throughput_per_sec / thresholds.min_throughput * 100.0).min(100.0)
        };
        let overall = 0.2 * p50_compliance
            + 0.3 * p95_compliance
            + 0.4 * p99_compliance
            + 0.1 * throughput_compliance;
        Self {
            p50_compliance,
            p95_compliance,
            p99_compliance,
            throughput_compliance,
            overall,
        }
    }
}

/// Which SLA dimension a violation tripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationKind {
    /// A single measurement exceeded the p99 target.
    PerCallLatency,
    /// The rolling p50 exceeded its target at flush time.
    LatencyP50,
    /// The rolling p95 exceeded its target at flush time.
    LatencyP95,
    /// The rolling p99 exceeded its target at flush time.
    LatencyP99,
    /// Throughput fell below the minimum at flush time.
    Throughput,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerCallLatency => "per_call_latency",
            Self::LatencyP50 => "latency_p50",
            Self::LatencyP95 => "latency_p95",
            Self::LatencyP99 => "latency_p99",
            Self::Throughput => "throughput",
        }
    }
}

/// How far past the threshold the observation landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    Warning,
    Critical,
}

/// One recorded SLA violation, retained for the configured window.
#[derive(Debug, Clone, Serialize)]
pub struct SlaViolation {
    pub kind: ViolationKind,
    pub operation: String,
    /// Observed value in microseconds (latency kinds) or measurements per
    /// second scaled by 1e6 (throughput kind).
    pub observed_us: u64,
    pub threshold_us: u64,
    pub cache_hit: bool,
    pub timestamp: DateTime<Utc>,
    pub severity: ViolationSeverity,
}

impl SlaViolation {
    /// Build a latency violation; severity escalates to Critical past 2x the
    /// threshold.
    pub fn latency(
        kind: ViolationKind,
        operation: impl Into<String>,
        observed: Duration,
        threshold: Duration,
        cache_hit: bool,
    ) -> Self {
        let observed_us = u64::try_from(observed.as_micros()).unwrap_or(u64::MAX);
        let threshold_us = u64::try_from(threshold.as_micros()).unwrap_or(u64::MAX);
        let severity = if observed_us >= threshold_us.saturating_mul(2) {
            ViolationSeverity::Critical
        } else {
            ViolationSeverity::Warning
        };
        Self {
            kind,
            operation: operation.into(),
            observed_us,
            threshold_us,
            cache_hit,
            timestamp: Utc::now(),
            severity,
        }
    }
}
