// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The audit event record.
//!
//! Events are immutable once published. Each carries a per-aggregate
//! sequence number, a severity, a tagged attribute map, and a SHA-256 hash
//! chained to the previous event of the same aggregate so archived history
//! is tamper-evident.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::errors::{Error, Result};

/// Event severity, ordered from least to most urgent. Critical events take
/// the priority queue through the publisher.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Critical)
    }
}

/// Domain event types of the exchange. Each maps to a topic category on the
/// partitioned log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Call lifecycle
    CallCreated,
    CallRouted,
    CallAnswered,
    CallCompleted,
    CallFailed,
    // Marketplace
    BidCreated,
    BidWon,
    BidLost,
    AuctionOpened,
    AuctionClosed,
    // Money movement
    PaymentProcessed,
    PayoutInitiated,
    InvoiceIssued,
    // Regulatory
    ConsentGranted,
    ConsentRevoked,
    DncCheckPerformed,
    DncNumberAdded,
    ComplianceViolation,
    // Security
    AuthSuccess,
    AuthFailure,
    AccessDenied,
    ConfigChanged,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CallCreated => "call_created",
            Self::CallRouted => "call_routed",
            Self::CallAnswered => "call_answered",
            Self::CallCompleted => "call_completed",
            Self::CallFailed => "call_failed",
            Self::BidCreated => "bid_created",
            Self::BidWon => "bid_won",
            Self::BidLost => "bid_lost",
            Self::AuctionOpened => "auction_opened",
            Self::AuctionClosed => "auction_closed",
            Self::PaymentProcessed => "payment_processed",
            Self::PayoutInitiated => "payout_initiated",
            Self::InvoiceIssued => "invoice_issued",
            Self::ConsentGranted => "consent_granted",
            Self::ConsentRevoked => "consent_revoked",
            Self::DncCheckPerformed => "dnc_check_performed",
            Self::DncNumberAdded => "dnc_number_added",
            Self::ComplianceViolation => "compliance_violation",
            Self::AuthSuccess => "auth_success",
            Self::AuthFailure => "auth_failure",
            Self::AccessDenied => "access_denied",
            Self::ConfigChanged => "config_changed",
        }
    }

    /// Topic category on the partitioned log.
    pub fn category(&self) -> &'static str {
        match self {
            Self::CallCreated
            | Self::CallRouted
            | Self::CallAnswered
            | Self::CallCompleted
            | Self::CallFailed => "calls",
            Self::BidCreated
            | Self::BidWon
            | Self::BidLost
            | Self::AuctionOpened
            | Self::AuctionClosed => "bids",
            Self::PaymentProcessed | Self::PayoutInitiated | Self::InvoiceIssued => "financial",
            Self::ConsentGranted
            | Self::ConsentRevoked
            | Self::DncCheckPerformed
            | Self::DncNumberAdded
            | Self::ComplianceViolation => "compliance",
            Self::AuthSuccess | Self::AuthFailure | Self::AccessDenied | Self::ConfigChanged => {
                "security"
            }
        }
    }
}

/// Tagged attribute value. Closed set; anything richer belongs in a string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int64(i64),
    Float64(f64),
    Bool(bool),
    StringList(Vec<String>),
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Maximum tolerated clock skew for event timestamps.
const MAX_FUTURE_SKEW_MINUTES: i64 = 5;

/// One immutable audit event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    /// Monotonic per-aggregate sequence number.
    pub sequence_num: u64,
    pub event_type: EventType,
    pub severity: Severity,
    /// UTC, microsecond resolution.
    pub timestamp: DateTime<Utc>,
    pub aggregate_id: String,
    pub aggregate_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub action: String,
    pub result: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, AttributeValue>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub compliance_flags: HashMap<String, bool>,
    /// SHA-256 over the event's identity fields and `previous_hash`.
    #[serde(with = "hex_bytes")]
    pub event_hash: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub previous_hash: Vec<u8>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(d)?;
        hex::decode(&raw).map_err(serde::de::Error::custom)
    }
}

impl AuditEvent {
    /// Create an event with a fresh id and the current timestamp. Sequence
    /// number and hash chain are assigned at publish time.
    pub fn new(
        event_type: EventType,
        severity: Severity,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        action: impl Into<String>,
        result: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence_num: 0,
            event_type,
            severity,
            timestamp: Utc::now(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            actor_id: None,
            target_id: None,
            action: action.into(),
            result: result.into(),
            attributes: HashMap::new(),
            compliance_flags: HashMap::new(),
            event_hash: Vec::new(),
            previous_hash: Vec::new(),
        }
    }

    pub fn with_sequence(mut self, sequence_num: u64) -> Self {
        self.sequence_num = sequence_num;
        self
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_compliance_flag(mut self, key: impl Into<String>, value: bool) -> Self {
        self.compliance_flags.insert(key.into(), value);
        self
    }

    /// Compute the chained hash over the identity fields and a previous
    /// hash.
    pub fn compute_hash(&self, previous_hash: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(self.sequence_num.to_be_bytes());
        hasher.update(self.event_type.as_str().as_bytes());
        hasher.update(self.timestamp.timestamp_micros().to_be_bytes());
        hasher.update(self.aggregate_id.as_bytes());
        hasher.update(self.action.as_bytes());
        hasher.update(self.result.as_bytes());
        hasher.update(previous_hash);
        hasher.finalize().to_vec()
    }

    /// Seal the event into the hash chain.
    pub fn seal(mut self, previous_hash: &[u8]) -> Self {
        self.previous_hash = previous_hash.to_vec();
        self.event_hash = self.compute_hash(previous_hash);
        self
    }

    /// Verify this event's hash against its recorded predecessor link.
    pub fn verify_chain(&self, previous: Option<&AuditEvent>) -> bool {
        if let Some(prev) = previous {
            if self.previous_hash != prev.event_hash {
                return false;
            }
        }
        self.event_hash == self.compute_hash(&self.previous_hash)
    }

    /// Structural validation performed at the publisher boundary.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_nil() {
            return Err(Error::Validation("event id must not be nil".to_string()));
        }
        if self.aggregate_id.trim().is_empty() {
            return Err(Error::Validation(
                "aggregate_id must be non-empty".to_string(),
            ));
        }
        if self.action.trim().is_empty() {
            return Err(Error::Validation("action must be non-empty".to_string()));
        }
        let max_future = Utc::now() + ChronoDuration::minutes(MAX_FUTURE_SKEW_MINUTES);
        if self.timestamp > max_future {
            return Err(Error::Validation(format!(
                "timestamp {} is too far in the future",
                self.timestamp.to_rfc3339()
            )));
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AuditEvent {
        AuditEvent::new(
            EventType::CallCreated,
            Severity::Info,
            "call",
            "call-42",
            "create",
            "success",
        )
    }

    #[test]
    fn new_event_validates() {
        let event = sample();
        assert!(event.validate().is_ok());
        assert!(!event.id.is_nil());
        assert_eq!(event.sequence_num, 0);
    }

    #[test]
    fn validation_rejects_empty_fields() {
        let mut event = sample();
        event.aggregate_id = "  ".to_string();
        assert!(matches!(event.validate(), Err(Error::Validation(_))));

        let mut event = sample();
        event.action = String::new();
        assert!(event.validate().is_err());

        let mut event = sample();
        event.id = Uuid::nil();
        assert!(event.validate().is_err());
    }

    #[test]
    fn validation_rejects_far_future_timestamps() {
        let mut event = sample();
        event.timestamp = Utc::now() + ChronoDuration::minutes(10);
        assert!(event.validate().is_err());

        // Skew inside the tolerance is fine.
        let mut event = sample();
        event.timestamp = Utc::now() + ChronoDuration::minutes(2);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn hash_chain_links_and_verifies() {
        let genesis = sample().with_sequence(1).seal(&[]);
        assert!(genesis.verify_chain(None));

        let next = AuditEvent::new(
            EventType::CallRouted,
            Severity::Info,
            "call",
            "call-42",
            "route",
            "success",
        )
        .with_sequence(2)
        .seal(&genesis.event_hash);

        assert!(next.verify_chain(Some(&genesis)));
        assert_eq!(next.previous_hash, genesis.event_hash);
    }

    #[test]
    fn tampering_breaks_the_chain() {
        let genesis = sample().with_sequence(1).seal(&[]);
        let mut next = AuditEvent::new(
            EventType::CallCompleted,
            Severity::Info,
            "call",
            "call-42",
            "complete",
            "success",
        )
        .with_sequence(2)
        .seal(&genesis.event_hash);

        next.result = "tampered".to_string();
        assert!(!next.verify_chain(Some(&genesis)));
    }

    #[test]
    fn builders_attach_optional_fields() {
        let event = sample()
            .with_actor("buyer-7")
            .with_target("seller-9")
            .with_attribute("duration_ms", 1200i64)
            .with_attribute("campaign", "spring")
            .with_compliance_flag("tcpa_consent", true);

        assert_eq!(event.actor_id.as_deref(), Some("buyer-7"));
        assert_eq!(event.target_id.as_deref(), Some("seller-9"));
        assert_eq!(
            event.attributes.get("duration_ms"),
            Some(&AttributeValue::Int64(1200))
        );
        assert_eq!(event.compliance_flags.get("tcpa_consent"), Some(&true));
    }

    #[test]
    fn severity_ordering_and_critical_flag() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Info);
        assert!(Severity::Critical.is_critical());
        assert!(!Severity::High.is_critical());
    }

    #[test]
    fn event_type_categories() {
        assert_eq!(EventType::CallCreated.category(), "calls");
        assert_eq!(EventType::BidWon.category(), "bids");
        assert_eq!(EventType::PaymentProcessed.category(), "financial");
        assert_eq!(EventType::ConsentRevoked.category(), "compliance");
        assert_eq!(EventType::AuthFailure.category(), "security");
    }

    #[test]
    fn json_round_trip_preserves_hashes() {
        let event = sample().with_sequence(3).seal(&[0xAB; 32]);
        let json = serde_json::to_string(&event).unwrap();
        let parsed: AuditEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_hash, event.event_hash);
        assert_eq!(parsed.previous_hash, event.previous_hash);
        assert_eq!(parsed.event_type, EventType::CallCreated);
        // Hashes travel as hex strings on the wire.
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["event_hash"].is_string());
    }

    #[test]
    fn attribute_values_serialize_naturally() {
        let event = sample()
            .with_attribute("count", 3i64)
            .with_attribute("ratio", 0.5f64)
            .with_attribute("ok", true)
            .with_attribute(
                "tags",
                AttributeValue::StringList(vec!["a".to_string(), "b".to_string()]),
            );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["attributes"]["count"], 3);
        assert_eq!(value["attributes"]["ok"], true);
        assert_eq!(value["attributes"]["tags"][1], "b");
    }
}
