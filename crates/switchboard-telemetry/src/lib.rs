// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! # Switchboard Telemetry
//!
//! Latency monitoring for the exchange's hot paths: DNC lookups and audit
//! event delivery. Measurements flow through a bounded buffer into percentile
//! trackers, an SLA compliance scorer, and a degradation detector; alerts are
//! deduplicated per kind with a cooldown.
//!
//! ## Pipeline
//!
//! ```text
//! record_latency() ──▶ bounded buffer ──flush──▶ percentile trackers
//!                                       │            (overall / hit / miss)
//!                                       ├──▶ degradation detector
//!                                       └──▶ snapshot stats + SLA scoring
//!                                                     │
//!                                                     └──▶ alert manager
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use switchboard_telemetry::{LatencyMonitor, MonitorConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let monitor = Arc::new(LatencyMonitor::new(MonitorConfig::default()));
//!     let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
//!     let _flush = monitor.spawn_flush_task(shutdown_tx.subscribe());
//!
//!     monitor.record_latency("dnc_query", Duration::from_micros(850), true);
//!     let stats = monitor.current_stats();
//!     println!("p99 = {}us", stats.p99_us);
//! }
//! ```

pub mod alerts;
pub mod degradation;
pub mod monitor;
pub mod percentile;
pub mod sla;

pub use alerts::{Alert, AlertKind, AlertManager, AlertSeverity};
pub use degradation::{Baseline, DegradationConfig, DegradationDetector, DegradationReport};
pub use monitor::{
    LatencyMonitor, LatencyStats, MonitorCollector, MonitorConfig, PerformanceTrend, SideStats,
    TrendDirection,
};
pub use percentile::PercentileTracker;
pub use sla::{SlaCompliance, SlaThresholds, SlaViolation, ViolationKind, ViolationSeverity};
