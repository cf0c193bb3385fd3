// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Wire envelope shared by the webhook and log transports, and the framed
//! variant carried over streaming sockets.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::AuditEvent;
use crate::filter::SubscriptionFilter;
use crate::EVENT_SCHEMA_VERSION;

/// JSON envelope: stable outer fields, full event under `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub event_version: u16,
    /// RFC 3339 with microseconds.
    pub timestamp: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub data: AuditEvent,
}

impl EventEnvelope {
    pub fn from_event(event: &AuditEvent) -> Self {
        Self {
            event_id: event.id,
            event_type: event.event_type.as_str().to_string(),
            event_version: EVENT_SCHEMA_VERSION,
            timestamp: event.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            aggregate_id: event.aggregate_id.clone(),
            aggregate_type: event.aggregate_type.clone(),
            data: event.clone(),
        }
    }

    pub fn to_json(&self) -> crate::errors::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Text frames on the streaming socket. Server → client frames carry
/// envelopes; client → server frames are small control messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    /// One event pushed to the subscriber.
    AuditEvent {
        event: EventEnvelope,
        timestamp: DateTime<Utc>,
    },
    /// Coalesced batch pushed to the subscriber.
    AuditEventBatch {
        events: Vec<EventEnvelope>,
        timestamp: DateTime<Utc>,
    },
    /// Client liveness probe.
    Ping,
    /// Server reply to a ping.
    Pong { timestamp: DateTime<Utc> },
    /// Client filter registration.
    Subscribe { filters: SubscriptionFilter },
}

impl StreamFrame {
    pub fn event(event: &AuditEvent) -> Self {
        Self::AuditEvent {
            event: EventEnvelope::from_event(event),
            timestamp: Utc::now(),
        }
    }

    pub fn batch(events: &[AuditEvent]) -> Self {
        Self::AuditEventBatch {
            events: events.iter().map(EventEnvelope::from_event).collect(),
            timestamp: Utc::now(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: Utc::now(),
        }
    }
}
