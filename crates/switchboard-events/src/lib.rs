// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)
// Switchboard Events - Real-Time Audit Event Fan-Out

//! # Switchboard Events
//!
//! Real-time fan-out of the exchange's audit events: ingest with priority
//! queueing and backpressure, indexed subscription routing, delivery across
//! streaming sockets, a partitioned log, and signed webhooks, with
//! at-least-once retry through a dead-letter queue.
//!
//! ## Data flow
//!
//! ```text
//!  publish(event)
//!    └─ validate → dedup → sequence/seal → backpressure → order
//!         └─ critical queue ──▶ critical workers ─┐
//!         └─ normal queue ──▶ workers + batcher ──┤
//!                                                 ▼
//!                                      SubscriptionRouter
//!                                                 │
//!                              {stream, log, webhook} transports
//!                                                 │
//!                              failures ──▶ dead-letter queue ──▶ retry
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use switchboard_events::{
//!     AuditEvent, EventPublisher, EventTransport, EventType, PublisherConfig,
//!     Severity, SubscriptionFilter, TransportProtocol,
//! };
//! use switchboard_events::transport::stream::{StreamTransport, StreamTransportConfig};
//! use switchboard_telemetry::{LatencyMonitor, MonitorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stream = Arc::new(StreamTransport::new(StreamTransportConfig::default()));
//!     let monitor = Arc::new(LatencyMonitor::new(MonitorConfig::default()));
//!     let publisher = EventPublisher::new(
//!         PublisherConfig::default(),
//!         vec![Arc::clone(&stream) as Arc<dyn EventTransport>],
//!         monitor,
//!     )?;
//!
//!     let subscription = publisher.subscribe(
//!         "compliance-team",
//!         TransportProtocol::Stream,
//!         SubscriptionFilter::match_all().with_severities([Severity::Critical]),
//!     )?;
//!     let _frames = stream.register(subscription.id);
//!
//!     publisher
//!         .publish(AuditEvent::new(
//!             EventType::ComplianceViolation,
//!             Severity::Critical,
//!             "call",
//!             "call-1042",
//!             "dnc_check",
//!             "blocked",
//!         ))
//!         .await?;
//!     Ok(())
//! }
//! ```

/// Wire schema version carried on every envelope.
pub const EVENT_SCHEMA_VERSION: u16 = 1;

pub mod backpressure;
pub mod config;
pub mod dlq;
pub mod envelope;
pub mod errors;
pub mod event;
pub mod filter;
pub mod metrics;
pub mod ordering;
pub mod publisher;
pub mod router;
pub mod store;
pub mod transport;
pub mod ws;

pub use backpressure::{BackpressureController, BackpressureStats, CircuitState};
pub use config::PublisherConfig;
pub use dlq::{DeadLetterQueue, DlqConfig, DlqStats, FailedEvent, Redeliver};
pub use envelope::{EventEnvelope, StreamFrame};
pub use errors::{Error, Result};
pub use event::{AttributeValue, AuditEvent, EventType, Severity};
pub use filter::SubscriptionFilter;
pub use metrics::{PublisherMetrics, PublisherMetricsCollector, PublisherMetricsSnapshot};
pub use ordering::{Deduplicator, OrderingBuffer};
pub use publisher::{DeliveryStats, EventPublisher, HealthStatus, Subscription};
pub use router::{RouterConfig, RouterStats, SubscriptionRouter};
pub use store::{EventStore, SqliteEventStore, StoredEvent};
pub use transport::{EventTransport, TransportProtocol};
