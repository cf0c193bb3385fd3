// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Subscription filters.
//!
//! A filter is a conjunction of optional dimensions; within a dimension the
//! listed values are alternatives. An empty filter matches every well-formed
//! event. Filters are immutable once registered with the router; replacing
//! one means unsubscribe + subscribe.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{AttributeValue, AuditEvent, EventType, Severity};

/// Multi-dimension event filter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_types: Option<HashSet<EventType>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub severities: Option<HashSet<Severity>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate_types: Option<HashSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate_ids: Option<HashSet<String>>,
    /// Matched against the event's actor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<HashSet<String>>,
    /// Closed-open interval on the event timestamp; live events only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// Unindexed equality predicates over event attributes.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, AttributeValue>,
}

impl SubscriptionFilter {
    /// A filter that matches everything.
    pub fn match_all() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.event_types = Some(types.into_iter().collect());
        self
    }

    pub fn with_severities(mut self, severities: impl IntoIterator<Item = Severity>) -> Self {
        self.severities = Some(severities.into_iter().collect());
        self
    }

    pub fn with_aggregate_types<S: Into<String>>(
        mut self,
        types: impl IntoIterator<Item = S>,
    ) -> Self {
        self.aggregate_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_aggregate_ids<S: Into<String>>(
        mut self,
        ids: impl IntoIterator<Item = S>,
    ) -> Self {
        self.aggregate_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_user_ids<S: Into<String>>(mut self, ids: impl IntoIterator<Item = S>) -> Self {
        self.user_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_time_range(mut self, from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.time_range = Some((from, until));
        self
    }

    pub fn with_custom(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
    ) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }

    /// True when no dimension constrains anything.
    pub fn is_empty(&self) -> bool {
        fn unset<T>(set: &Option<HashSet<T>>) -> bool {
            set.as_ref().map(|s| s.is_empty()).unwrap_or(true)
        }
        unset(&self.event_types)
            && unset(&self.severities)
            && unset(&self.aggregate_types)
            && unset(&self.aggregate_ids)
            && unset(&self.user_ids)
            && self.time_range.is_none()
            && self.custom.is_empty()
    }

    /// Full conjunctive check. The router uses its indexes to narrow
    /// candidates first, but membership in an index never substitutes for
    /// this.
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(types) = &self.event_types {
            if !types.is_empty() && !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(severities) = &self.severities {
            if !severities.is_empty() && !severities.contains(&event.severity) {
                return false;
            }
        }
        if let Some(types) = &self.aggregate_types {
            if !types.is_empty() && !types.contains(&event.aggregate_type) {
                return false;
            }
        }
        if let Some(ids) = &self.aggregate_ids {
            if !ids.is_empty() && !ids.contains(&event.aggregate_id) {
                return false;
            }
        }
        if let Some(users) = &self.user_ids {
            if !users.is_empty() {
                match &event.actor_id {
                    Some(actor) if users.contains(actor) => {}
                    _ => return false,
                }
            }
        }
        if let Some((from, until)) = &self.time_range {
            if event.timestamp < *from || event.timestamp >= *until {
                return false;
            }
        }
        for (key, expected) in &self.custom {
            match event.attributes.get(key) {
                Some(actual) if actual == expected => {}
                _ => return false,
            }
        }
        true
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn event(event_type: EventType, severity: Severity) -> AuditEvent {
        AuditEvent::new(event_type, severity, "call", "call-1", "create", "success")
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = SubscriptionFilter::match_all();
        assert!(filter.is_empty());
        assert!(filter.matches(&event(EventType::CallCreated, Severity::Info)));
        assert!(filter.matches(&event(EventType::AuthFailure, Severity::Critical)));
    }

    #[test]
    fn filter_with_empty_sets_is_still_empty() {
        let filter = SubscriptionFilter {
            event_types: Some(HashSet::new()),
            ..SubscriptionFilter::default()
        };
        assert!(filter.is_empty());
        assert!(filter.matches(&event(EventType::BidWon, Severity::Low)));
    }

    #[test]
    fn event_type_dimension_is_an_or_set() {
        let filter = SubscriptionFilter::match_all()
            .with_event_types([EventType::CallCreated, EventType::CallCompleted]);
        assert!(filter.matches(&event(EventType::CallCreated, Severity::Info)));
        assert!(filter.matches(&event(EventType::CallCompleted, Severity::Info)));
        assert!(!filter.matches(&event(EventType::BidCreated, Severity::Info)));
    }

    #[test]
    fn dimensions_combine_conjunctively() {
        let filter = SubscriptionFilter::match_all()
            .with_event_types([EventType::CallCreated])
            .with_severities([Severity::Info]);
        assert!(filter.matches(&event(EventType::CallCreated, Severity::Info)));
        assert!(!filter.matches(&event(EventType::CallCreated, Severity::High)));
        assert!(!filter.matches(&event(EventType::BidCreated, Severity::Info)));
    }

    #[test]
    fn user_dimension_requires_an_actor() {
        let filter = SubscriptionFilter::match_all().with_user_ids(["buyer-1"]);
        let without_actor = event(EventType::CallCreated, Severity::Info);
        assert!(!filter.matches(&without_actor));

        let with_actor = without_actor.clone().with_actor("buyer-1");
        assert!(filter.matches(&with_actor));

        let other_actor = without_actor.with_actor("buyer-2");
        assert!(!filter.matches(&other_actor));
    }

    #[test]
    fn time_range_is_closed_open() {
        let mut e = event(EventType::CallCreated, Severity::Info);
        let from = e.timestamp;
        let until = from + ChronoDuration::seconds(60);
        let filter = SubscriptionFilter::match_all().with_time_range(from, until);

        assert!(filter.matches(&e), "start boundary is inclusive");

        e.timestamp = until;
        assert!(!filter.matches(&e), "end boundary is exclusive");

        e.timestamp = from - ChronoDuration::seconds(1);
        assert!(!filter.matches(&e));
    }

    #[test]
    fn custom_predicates_match_attribute_equality() {
        let filter = SubscriptionFilter::match_all().with_custom("campaign", "spring");
        let plain = event(EventType::CallCreated, Severity::Info);
        assert!(!filter.matches(&plain));

        let tagged = plain.clone().with_attribute("campaign", "spring");
        assert!(filter.matches(&tagged));

        let other = plain.with_attribute("campaign", "winter");
        assert!(!filter.matches(&other));
    }

    #[test]
    fn aggregate_dimensions() {
        let filter = SubscriptionFilter::match_all()
            .with_aggregate_types(["call"])
            .with_aggregate_ids(["call-1"]);
        assert!(filter.matches(&event(EventType::CallCreated, Severity::Info)));

        let mut other = event(EventType::CallCreated, Severity::Info);
        other.aggregate_id = "call-2".to_string();
        assert!(!filter.matches(&other));
    }

    #[test]
    fn filter_serializes_compactly() {
        let filter = SubscriptionFilter::match_all().with_event_types([EventType::CallCreated]);
        let value = serde_json::to_value(&filter).unwrap();
        assert!(value.get("severities").is_none());
        assert!(value.get("custom").is_none());
        assert_eq!(value["event_types"][0], "call_created");
    }
}
