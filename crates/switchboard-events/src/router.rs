// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Subscription router: inverted indexes plus a bounded decision cache.
//!
//! Five indexes (event type, severity, aggregate type, aggregate id, user)
//! narrow the candidate set; every candidate still passes the full
//! conjunctive filter check, so an index hit alone never implies a match.
//! The decision cache is cleared atomically on any subscription mutation,
//! before the next match can observe stale routes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use uuid::Uuid;

use crate::event::{AuditEvent, EventType, Severity};
use crate::filter::SubscriptionFilter;

/// Router tuning.
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    /// Bounded decision-cache entries.
    pub decision_cache_size: usize,
    /// Per-entry decision-cache TTL.
    pub decision_cache_ttl: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            decision_cache_size: 4096,
            decision_cache_ttl: Duration::from_secs(60),
        }
    }
}

/// Decision-cache key: the event attributes the indexes consult.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    event_type: EventType,
    severity: Severity,
    aggregate_type: String,
    aggregate_id: String,
    user_id: Option<String>,
}

impl RouteKey {
    fn for_event(event: &AuditEvent) -> Self {
        Self {
            event_type: event.event_type,
            severity: event.severity,
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            user_id: event.actor_id.clone(),
        }
    }
}

struct CacheSlot {
    subscriptions: Vec<Uuid>,
    inserted_at: Instant,
}

#[derive(Default)]
struct Indexes {
    by_event_type: HashMap<EventType, HashSet<Uuid>>,
    by_severity: HashMap<Severity, HashSet<Uuid>>,
    by_aggregate_type: HashMap<String, HashSet<Uuid>>,
    by_aggregate_id: HashMap<String, HashSet<Uuid>>,
    by_user: HashMap<String, HashSet<Uuid>>,
    /// Subscriptions with an empty filter match every event.
    match_all: HashSet<Uuid>,
    filters: HashMap<Uuid, SubscriptionFilter>,
}

/// Router statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub subscriptions: usize,
    pub cache_entries: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub invalidations: u64,
}

/// Indexed multi-dimensional subscription router.
pub struct SubscriptionRouter {
    config: RouterConfig,
    indexes: RwLock<Indexes>,
    cache: Mutex<HashMap<RouteKey, CacheSlot>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    invalidations: AtomicU64,
}

impl SubscriptionRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            indexes: RwLock::new(Indexes::default()),
            cache: Mutex::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Register a subscription's filter and invalidate the decision cache.
    pub fn register(&self, id: Uuid, filter: SubscriptionFilter) {
        {
            let mut idx = self.indexes.write();
            if filter.is_empty() {
                idx.match_all.insert(id);
            } else {
                if let Some(types) = &filter.event_types {
                    for t in types {
                        idx.by_event_type.entry(*t).or_default().insert(id);
                    }
                }
                if let Some(severities) = &filter.severities {
                    for s in severities {
                        idx.by_severity.entry(*s).or_default().insert(id);
                    }
                }
                if let Some(types) = &filter.aggregate_types {
                    for t in types {
                        idx.by_aggregate_type.entry(t.clone()).or_default().insert(id);
                    }
                }
                if let Some(ids) = &filter.aggregate_ids {
                    for a in ids {
                        idx.by_aggregate_id.entry(a.clone()).or_default().insert(id);
                    }
                }
                if let Some(users) = &filter.user_ids {
                    for u in users {
                        idx.by_user.entry(u.clone()).or_default().insert(id);
                    }
                }
            }
            idx.filters.insert(id, filter);
        }
        self.invalidate_cache();
    }

    /// Remove a subscription from every index. Returns whether it existed.
    pub fn unregister(&self, id: Uuid) -> bool {
        let existed = {
            let mut idx = self.indexes.write();
            let existed = idx.filters.remove(&id).is_some();
            idx.match_all.remove(&id);
            for set in idx.by_event_type.values_mut() {
                set.remove(&id);
            }
            for set in idx.by_severity.values_mut() {
                set.remove(&id);
            }
            for set in idx.by_aggregate_type.values_mut() {
                set.remove(&id);
            }
            for set in idx.by_aggregate_id.values_mut() {
                set.remove(&id);
            }
            for set in idx.by_user.values_mut() {
                set.remove(&id);
            }
            idx.by_event_type.retain(|_, s| !s.is_empty());
            idx.by_severity.retain(|_, s| !s.is_empty());
            idx.by_aggregate_type.retain(|_, s| !s.is_empty());
            idx.by_aggregate_id.retain(|_, s| !s.is_empty());
            idx.by_user.retain(|_, s| !s.is_empty());
            existed
        };
        self.invalidate_cache();
        existed
    }

    /// Subscriptions whose filter matches the event, in stable order.
    pub fn route(&self, event: &AuditEvent) -> Vec<Uuid> {
        let key = RouteKey::for_event(event);

        {
            let cache = self.cache.lock();
            if let Some(slot) = cache.get(&key) {
                if slot.inserted_at.elapsed() < self.config.decision_cache_ttl {
                    self.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return slot.subscriptions.clone();
                }
            }
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let matched = {
            let idx = self.indexes.read();
            let mut candidates: HashSet<Uuid> = idx.match_all.iter().copied().collect();
            if let Some(set) = idx.by_event_type.get(&event.event_type) {
                candidates.extend(set);
            }
            if let Some(set) = idx.by_severity.get(&event.severity) {
                candidates.extend(set);
            }
            if let Some(set) = idx.by_aggregate_type.get(&event.aggregate_type) {
                candidates.extend(set);
            }
            if let Some(set) = idx.by_aggregate_id.get(&event.aggregate_id) {
                candidates.extend(set);
            }
            // Absent actor: the user index is not consulted.
            if let Some(actor) = &event.actor_id {
                if let Some(set) = idx.by_user.get(actor) {
                    candidates.extend(set);
                }
            }

            let mut matched: Vec<Uuid> = candidates
                .into_iter()
                .filter(|id| {
                    idx.filters
                        .get(id)
                        .map(|f| f.matches(event))
                        .unwrap_or(false)
                })
                .collect();
            matched.sort_unstable();
            matched
        };

        self.cache_insert(key, matched.clone());
        matched
    }

    fn cache_insert(&self, key: RouteKey, subscriptions: Vec<Uuid>) {
        let mut cache = self.cache.lock();
        if cache.len() >= self.config.decision_cache_size && !cache.contains_key(&key) {
            // Drop expired slots first; fall back to the oldest.
            let ttl = self.config.decision_cache_ttl;
            let expired: Vec<RouteKey> = cache
                .iter()
                .filter(|(_, slot)| slot.inserted_at.elapsed() >= ttl)
                .map(|(k, _)| k.clone())
                .collect();
            if expired.is_empty() {
                if let Some(oldest) = cache
                    .iter()
                    .min_by_key(|(_, slot)| slot.inserted_at)
                    .map(|(k, _)| k.clone())
                {
                    cache.remove(&oldest);
                }
            } else {
                for k in expired {
                    cache.remove(&k);
                }
            }
        }
        cache.insert(
            key,
            CacheSlot {
                subscriptions,
                inserted_at: Instant::now(),
            },
        );
    }

    fn invalidate_cache(&self) {
        self.cache.lock().clear();
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscription_count(&self) -> usize {
        self.indexes.read().filters.len()
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            subscriptions: self.subscription_count(),
            cache_entries: self.cache.lock().len(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

impl Default for SubscriptionRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: EventType, severity: Severity) -> AuditEvent {
        AuditEvent::new(event_type, severity, "call", "call-1", "create", "success")
    }

    #[test]
    fn empty_filter_subscription_matches_every_event() {
        let router = SubscriptionRouter::default();
        let id = Uuid::new_v4();
        router.register(id, SubscriptionFilter::match_all());

        assert_eq!(router.route(&event(EventType::CallCreated, Severity::Info)), vec![id]);
        assert_eq!(
            router.route(&event(EventType::AuthFailure, Severity::Critical)),
            vec![id]
        );
    }

    #[test]
    fn routes_by_type_and_severity_conjunction() {
        let router = SubscriptionRouter::default();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();
        router.register(
            s1,
            SubscriptionFilter::match_all()
                .with_event_types([EventType::CallCreated])
                .with_severities([Severity::Info]),
        );
        router.register(
            s2,
            SubscriptionFilter::match_all()
                .with_event_types([EventType::BidCreated])
                .with_severities([Severity::High]),
        );

        assert_eq!(router.route(&event(EventType::CallCreated, Severity::Info)), vec![s1]);
        assert_eq!(router.route(&event(EventType::BidCreated, Severity::High)), vec![s2]);
        // Index hit on type alone must not match: severity check rejects.
        assert!(router
            .route(&event(EventType::CallCreated, Severity::High))
            .is_empty());
    }

    #[test]
    fn index_hit_alone_does_not_imply_match() {
        let router = SubscriptionRouter::default();
        let id = Uuid::new_v4();
        // Filter on type + a custom attribute the index can't see.
        router.register(
            id,
            SubscriptionFilter::match_all()
                .with_event_types([EventType::CallCreated])
                .with_custom("campaign", "spring"),
        );

        assert!(router.route(&event(EventType::CallCreated, Severity::Info)).is_empty());

        let tagged = event(EventType::CallCreated, Severity::Info)
            .with_attribute("campaign", "spring");
        assert_eq!(router.route(&tagged), vec![id]);
    }

    #[test]
    fn absent_actor_skips_user_index() {
        let router = SubscriptionRouter::default();
        let id = Uuid::new_v4();
        router.register(id, SubscriptionFilter::match_all().with_user_ids(["buyer-1"]));

        assert!(router.route(&event(EventType::CallCreated, Severity::Info)).is_empty());

        let with_actor = event(EventType::CallCreated, Severity::Info).with_actor("buyer-1");
        assert_eq!(router.route(&with_actor), vec![id]);
    }

    #[test]
    fn unregister_restores_prior_state() {
        let router = SubscriptionRouter::default();
        let e = event(EventType::CallCreated, Severity::Info);
        assert!(router.route(&e).is_empty());

        let id = Uuid::new_v4();
        router.register(id, SubscriptionFilter::match_all());
        assert_eq!(router.route(&e), vec![id]);

        assert!(router.unregister(id));
        assert!(router.route(&e).is_empty());
        assert_eq!(router.subscription_count(), 0);
        assert!(!router.unregister(id), "second unregister is a no-op");
    }

    #[test]
    fn decision_cache_hits_on_repeat_and_clears_on_mutation() {
        let router = SubscriptionRouter::default();
        let id = Uuid::new_v4();
        router.register(id, SubscriptionFilter::match_all());

        let e = event(EventType::CallCreated, Severity::Info);
        router.route(&e);
        router.route(&e);
        let stats = router.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);

        // A new subscription must invalidate before the next match.
        let id2 = Uuid::new_v4();
        router.register(id2, SubscriptionFilter::match_all());
        let matched = router.route(&e);
        assert_eq!(matched.len(), 2);
        assert!(matched.contains(&id) && matched.contains(&id2));
    }

    #[test]
    fn decision_cache_is_bounded() {
        let router = SubscriptionRouter::new(RouterConfig {
            decision_cache_size: 4,
            decision_cache_ttl: Duration::from_secs(60),
        });
        router.register(Uuid::new_v4(), SubscriptionFilter::match_all());
        for i in 0..32 {
            let mut e = event(EventType::CallCreated, Severity::Info);
            e.aggregate_id = format!("call-{i}");
            router.route(&e);
        }
        assert!(router.stats().cache_entries <= 4);
    }

    #[test]
    fn route_output_is_sorted_and_deterministic() {
        let router = SubscriptionRouter::default();
        let mut ids: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            router.register(*id, SubscriptionFilter::match_all());
        }
        ids.sort_unstable();

        let matched = router.route(&event(EventType::CallCreated, Severity::Info));
        assert_eq!(matched, ids);
    }

    #[test]
    fn severity_only_filter_uses_severity_index() {
        let router = SubscriptionRouter::default();
        let id = Uuid::new_v4();
        router.register(
            id,
            SubscriptionFilter::match_all().with_severities([Severity::Critical]),
        );
        assert!(router.route(&event(EventType::CallCreated, Severity::Info)).is_empty());
        assert_eq!(
            router.route(&event(EventType::CallCreated, Severity::Critical)),
            vec![id]
        );
    }
}
