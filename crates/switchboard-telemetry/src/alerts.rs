// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Alert fan-out with per-kind cooldown deduplication.
//!
//! Alerts go out on a broadcast channel so any number of consumers (log
//! sinks, tests, an ops bridge) can subscribe without coupling the monitor
//! to them. Repeated alerts of the same kind inside the cooldown window are
//! suppressed and counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;

/// What kind of condition fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AlertKind {
    /// A single measurement blew through an SLA threshold.
    SlaViolation,
    /// Rolling SLA compliance fell below the floor.
    ComplianceLow,
    /// The degradation detector tripped against the baseline.
    Degradation,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SlaViolation => "sla_violation",
            Self::ComplianceLow => "compliance_low",
            Self::Degradation => "degradation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// One emitted alert.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Deduplicating alert dispatcher.
pub struct AlertManager {
    tx: broadcast::Sender<Alert>,
    cooldown: Duration,
    last_fired: Mutex<HashMap<AlertKind, Instant>>,
    fired_total: AtomicU64,
    suppressed_total: AtomicU64,
}

impl AlertManager {
    /// `capacity` bounds the broadcast backlog; lagging subscribers drop the
    /// oldest alerts, same as any broadcast consumer.
    pub fn new(cooldown: Duration, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            cooldown,
            last_fired: Mutex::new(HashMap::new()),
            fired_total: AtomicU64::new(0),
            suppressed_total: AtomicU64::new(0),
        }
    }

    /// Subscribe to future alerts.
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }

    /// Fire an alert unless one of the same kind fired within the cooldown.
    ///
    /// Returns true when the alert was actually dispatched.
    pub fn fire(&self, alert: Alert) -> bool {
        {
            let mut last = self.last_fired.lock();
            if let Some(at) = last.get(&alert.kind) {
                if at.elapsed() < self.cooldown {
                    self.suppressed_total.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
            last.insert(alert.kind, Instant::now());
        }

        self.fired_total.fetch_add(1, Ordering::Relaxed);
        match alert.severity {
            AlertSeverity::Critical => tracing::error!(
                kind = alert.kind.as_str(),
                message = %alert.message,
                "telemetry alert"
            ),
            AlertSeverity::Warning => tracing::warn!(
                kind = alert.kind.as_str(),
                message = %alert.message,
                "telemetry alert"
            ),
        }
        // No receivers is fine; the log line above is the floor.
        let _ = self.tx.send(alert);
        true
    }

    pub fn fired_total(&self) -> u64 {
        self.fired_total.load(Ordering::Relaxed)
    }

    pub fn suppressed_total(&self) -> u64 {
        self.suppressed_total.load(Ordering::Relaxed)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_and_delivers_to_subscriber() {
        let mgr = AlertManager::new(Duration::from_secs(60), 16);
        let mut rx = mgr.subscribe();
        assert!(mgr.fire(Alert::new(
            AlertKind::SlaViolation,
            AlertSeverity::Warning,
            "p99 over budget"
        )));
        let alert = rx.try_recv().unwrap();
        assert_eq!(alert.kind, AlertKind::SlaViolation);
        assert_eq!(mgr.fired_total(), 1);
    }

    #[test]
    fn cooldown_suppresses_same_kind() {
        let mgr = AlertManager::new(Duration::from_secs(60), 16);
        assert!(mgr.fire(Alert::new(
            AlertKind::Degradation,
            AlertSeverity::Critical,
            "p99 2.5x baseline"
        )));
        assert!(!mgr.fire(Alert::new(
            AlertKind::Degradation,
            AlertSeverity::Critical,
            "p99 2.6x baseline"
        )));
        assert_eq!(mgr.fired_total(), 1);
        assert_eq!(mgr.suppressed_total(), 1);
    }

    #[test]
    fn cooldown_is_per_kind() {
        let mgr = AlertManager::new(Duration::from_secs(60), 16);
        assert!(mgr.fire(Alert::new(
            AlertKind::SlaViolation,
            AlertSeverity::Warning,
            "violation"
        )));
        assert!(mgr.fire(Alert::new(
            AlertKind::ComplianceLow,
            AlertSeverity::Warning,
            "compliance 92%"
        )));
        assert_eq!(mgr.fired_total(), 2);
    }

    #[test]
    fn zero_cooldown_never_suppresses() {
        let mgr = AlertManager::new(Duration::ZERO, 16);
        for _ in 0..3 {
            assert!(mgr.fire(Alert::new(
                AlertKind::SlaViolation,
                AlertSeverity::Warning,
                "violation"
            )));
        }
        assert_eq!(mgr.fired_total(), 3);
    }

    #[test]
    fn firing_without_subscribers_does_not_error() {
        let mgr = AlertManager::new(Duration::ZERO, 16);
        assert!(mgr.fire(Alert::new(
            AlertKind::ComplianceLow,
            AlertSeverity::Warning,
            "no listeners"
        )));
    }
}
