// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Partitioned-log transport over Kafka.
//!
//! Messages are keyed by aggregate id (falling back to actor, then event
//! id) so every aggregate's events land on one partition and keep their
//! order. Critical events route to the `<prefix>.critical` topic; other
//! events go to their category topic.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use uuid::Uuid;

use crate::envelope::EventEnvelope;
use crate::errors::{Error, Result};
use crate::event::AuditEvent;
use crate::transport::{EventTransport, HealthTracker, TransportProtocol, DEFAULT_HEALTH_TIMEOUT};

/// Log transport tuning.
#[derive(Debug, Clone)]
pub struct LogTransportConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Topic namespace, e.g. `switchboard` yields `switchboard.calls`.
    pub topic_prefix: String,
    /// Kafka compression codec (none, gzip, snappy, lz4, zstd).
    pub compression: String,
    /// Idempotent writes; keeps broker-side retries duplicate-free.
    pub enable_idempotence: bool,
    /// Max in-flight requests per connection. Idempotence caps this at 5.
    pub max_in_flight: i32,
    /// Broker acknowledgment timeout per send.
    pub message_timeout: Duration,
    /// Send-recency window for health.
    pub health_timeout: Duration,
}

impl Default for LogTransportConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            topic_prefix: "switchboard".to_string(),
            compression: "none".to_string(),
            enable_idempotence: true,
            max_in_flight: 5,
            message_timeout: Duration::from_secs(30),
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
        }
    }
}

impl LogTransportConfig {
    pub fn validate(mut self) -> Result<Self> {
        let brokers: Vec<&str> = self
            .bootstrap_servers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if brokers.is_empty() {
            return Err(Error::Kafka(
                "bootstrap_servers must contain at least one broker".to_string(),
            ));
        }
        self.bootstrap_servers = brokers.join(",");
        if self.topic_prefix.trim().is_empty() {
            return Err(Error::Kafka("topic_prefix must be non-empty".to_string()));
        }
        match self.compression.as_str() {
            "none" | "gzip" | "snappy" | "lz4" | "zstd" => {}
            other => {
                return Err(Error::Kafka(format!(
                    "invalid compression '{other}'; expected none|gzip|snappy|lz4|zstd"
                )));
            }
        }
        if self.max_in_flight <= 0 {
            tracing::warn!(
                provided = self.max_in_flight,
                "max_in_flight must be > 0; using 1"
            );
            self.max_in_flight = 1;
        }
        if self.enable_idempotence && self.max_in_flight > 5 {
            tracing::warn!(
                provided = self.max_in_flight,
                clamped = 5,
                "enable_idempotence requires max_in_flight <= 5; clamping"
            );
            self.max_in_flight = 5;
        }
        Ok(self)
    }
}

/// Topic for an event: critical severity outranks category.
pub fn topic_for(prefix: &str, event: &AuditEvent) -> String {
    if event.severity.is_critical() {
        format!("{prefix}.critical")
    } else {
        format!("{prefix}.{}", event.event_type.category())
    }
}

/// Partition key: aggregate, then actor, then event id.
pub fn partition_key(event: &AuditEvent) -> String {
    if !event.aggregate_id.is_empty() {
        event.aggregate_id.clone()
    } else if let Some(actor) = &event.actor_id {
        actor.clone()
    } else {
        event.id.to_string()
    }
}

fn event_headers(event: &AuditEvent) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new()
        .insert(Header {
            key: "event_id",
            value: Some(&event.id.to_string()),
        })
        .insert(Header {
            key: "event_type",
            value: Some(event.event_type.as_str()),
        })
        .insert(Header {
            key: "severity",
            value: Some(event.severity.as_str()),
        })
        .insert(Header {
            key: "entity_id",
            value: Some(&event.aggregate_id),
        });
    if let Some(actor) = &event.actor_id {
        headers = headers.insert(Header {
            key: "user_id",
            value: Some(actor),
        });
    }
    headers
}

/// Kafka-backed log transport.
pub struct LogTransport {
    producer: FutureProducer,
    config: LogTransportConfig,
    health: HealthTracker,
}

impl LogTransport {
    pub fn new(config: LogTransportConfig) -> Result<Self> {
        let config = config.validate()?;
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("compression.type", &config.compression)
            .set(
                "enable.idempotence",
                if config.enable_idempotence { "true" } else { "false" },
            )
            .set(
                "max.in.flight.requests.per.connection",
                config.max_in_flight.to_string(),
            )
            .set("acks", "all")
            .set(
                "message.timeout.ms",
                config.message_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| Error::Kafka(format!("failed to create producer: {e}")))?;

        Ok(Self {
            producer,
            health: HealthTracker::new(config.health_timeout),
            config,
        })
    }

    async fn produce(&self, event: &AuditEvent) -> Result<()> {
        let envelope = EventEnvelope::from_event(event);
        let payload = envelope.to_json()?;
        let topic = topic_for(&self.config.topic_prefix, event);
        let key = partition_key(event);

        let record = FutureRecord::to(&topic)
            .payload(&payload)
            .key(&key)
            .headers(event_headers(event));

        self.producer
            .send(record, Timeout::After(self.config.message_timeout))
            .await
            .map_err(|(e, _)| Error::Kafka(format!("send to {topic} failed: {e}")))?;
        self.health.note_success();
        Ok(())
    }

    /// Flush outstanding deliveries, best-effort.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| Error::Internal(format!("flush task join failed: {e}")))?
            .map_err(|e| Error::Kafka(format!("producer flush failed: {e}")))
    }
}

#[async_trait]
impl EventTransport for LogTransport {
    async fn send(&self, event: &AuditEvent, _subscriber_ids: &[Uuid]) -> Result<()> {
        // Log delivery is per-topic, not per-subscriber; subscriptions on
        // this protocol share the partitioned stream.
        self.produce(event).await
    }

    async fn send_batch(&self, events: &[AuditEvent], _subscriber_ids: &[Uuid]) -> Result<()> {
        // Sequential sends preserve per-aggregate order on the shared key.
        for event in events {
            self.produce(event).await?;
        }
        Ok(())
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Log
    }

    fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    async fn close(&self) {
        if let Err(e) = self.flush(Duration::from_secs(5)).await {
            tracing::warn!(error = %e, "log transport flush on close failed");
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventType, Severity};

    fn event(event_type: EventType, severity: Severity) -> AuditEvent {
        AuditEvent::new(event_type, severity, "call", "call-1", "create", "success")
    }

    #[test]
    fn critical_severity_outranks_category_topic() {
        let e = event(EventType::CallCreated, Severity::Critical);
        assert_eq!(topic_for("switchboard", &e), "switchboard.critical");
    }

    #[test]
    fn category_topics_per_event_type() {
        let cases = [
            (EventType::CallCreated, "switchboard.calls"),
            (EventType::BidWon, "switchboard.bids"),
            (EventType::PaymentProcessed, "switchboard.financial"),
            (EventType::ConsentRevoked, "switchboard.compliance"),
            (EventType::AuthFailure, "switchboard.security"),
        ];
        for (event_type, expected) in cases {
            let e = event(event_type, Severity::Info);
            assert_eq!(topic_for("switchboard", &e), expected);
        }
    }

    #[test]
    fn partition_key_falls_back_aggregate_actor_event() {
        let e = event(EventType::CallCreated, Severity::Info);
        assert_eq!(partition_key(&e), "call-1");

        let mut no_aggregate = e.clone().with_actor("buyer-9");
        no_aggregate.aggregate_id = String::new();
        assert_eq!(partition_key(&no_aggregate), "buyer-9");

        let mut bare = event(EventType::CallCreated, Severity::Info);
        bare.aggregate_id = String::new();
        assert_eq!(partition_key(&bare), bare.id.to_string());
    }

    #[test]
    fn config_validation() {
        assert!(LogTransportConfig::default().validate().is_ok());

        let bad_brokers = LogTransportConfig {
            bootstrap_servers: " , ".to_string(),
            ..LogTransportConfig::default()
        };
        assert!(bad_brokers.validate().is_err());

        let bad_compression = LogTransportConfig {
            compression: "brotli".to_string(),
            ..LogTransportConfig::default()
        };
        assert!(bad_compression.validate().is_err());

        let clamped = LogTransportConfig {
            enable_idempotence: true,
            max_in_flight: 20,
            ..LogTransportConfig::default()
        }
        .validate()
        .unwrap();
        assert_eq!(clamped.max_in_flight, 5);

        let zero_in_flight = LogTransportConfig {
            max_in_flight: 0,
            ..LogTransportConfig::default()
        }
        .validate()
        .unwrap();
        assert_eq!(zero_in_flight.max_in_flight, 1);
    }

    #[test]
    fn headers_carry_event_identity() {
        use rdkafka::message::Headers;

        let e = event(EventType::CallCreated, Severity::High).with_actor("buyer-1");
        let headers = event_headers(&e);
        let keys: Vec<&str> = (0..headers.count())
            .map(|i| headers.get(i).key)
            .collect();
        assert!(keys.contains(&"event_id"));
        assert!(keys.contains(&"event_type"));
        assert!(keys.contains(&"severity"));
        assert!(keys.contains(&"entity_id"));
        assert!(keys.contains(&"user_id"));
    }
}
