//! Short-term identity cache.
//!
//! Capacity-bounded LRU with TTL expiry. A single mutex guards the whole
//! map and recency index, so every operation is atomic with respect to
//! both. Callers copy what they need out of the cache and never hold the
//! lock across an await.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use percept_models::IdentityId;
use serde::Serialize;
use tracing::debug;

use crate::config::CacheConfig;
use crate::identity::TrackedIdentity;
use crate::metrics;

// =============================================================================
// Entries
// =============================================================================

struct CacheEntry {
    value: TrackedIdentity,
    /// Position in the recency index; larger is more recent
    tick: u64,
    /// When the entry was inserted or last touched
    touched_at: DateTime<Utc>,
}

struct CacheInner {
    entries: HashMap<IdentityId, CacheEntry>,
    /// Recency index: tick -> key, oldest first
    order: BTreeMap<u64, IdentityId>,
    next_tick: u64,
    stats: CacheStats,
}

impl CacheInner {
    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn touch(&mut self, id: &IdentityId) {
        let tick = self.bump();
        if let Some(entry) = self.entries.get_mut(id) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            entry.touched_at = Utc::now();
            self.order.insert(tick, *id);
        }
    }

    fn remove(&mut self, id: &IdentityId) -> Option<TrackedIdentity> {
        let entry = self.entries.remove(id)?;
        self.order.remove(&entry.tick);
        Some(entry.value)
    }

    fn pop_lru(&mut self) -> Option<TrackedIdentity> {
        let (_, id) = self.order.pop_first()?;
        self.entries.remove(&id).map(|e| e.value)
    }
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired: u64,
}

// =============================================================================
// Cache
// =============================================================================

/// Thread-safe LRU + TTL store of tracked identities.
pub struct ShortTermCache {
    capacity: usize,
    ttl: chrono::Duration,
    inner: Mutex<CacheInner>,
}

impl ShortTermCache {
    /// Create a cache from configuration.
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_capacity(config.capacity, config.ttl())
    }

    /// Create a cache with explicit bounds. Capacity is at least one.
    pub fn with_capacity(capacity: usize, ttl: chrono::Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_tick: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up an identity and mark it most recently used.
    pub fn get(&self, id: &IdentityId) -> Option<TrackedIdentity> {
        let mut inner = self.lock();
        if inner.entries.contains_key(id) {
            inner.touch(id);
            inner.stats.hits += 1;
            inner.entries.get(id).map(|e| e.value.clone())
        } else {
            inner.stats.misses += 1;
            None
        }
    }

    /// Look up an identity without changing its recency.
    pub fn peek(&self, id: &IdentityId) -> Option<TrackedIdentity> {
        self.lock().entries.get(id).map(|e| e.value.clone())
    }

    /// Insert or refresh an identity at the most recently used position.
    ///
    /// Returns the least recently used identity if the insert pushed the
    /// cache over capacity.
    pub fn set(&self, id: IdentityId, value: TrackedIdentity) -> Option<TrackedIdentity> {
        let mut inner = self.lock();
        let tick = inner.bump();
        let now = Utc::now();

        if let Some(previous) = inner.entries.insert(
            id,
            CacheEntry {
                value,
                tick,
                touched_at: now,
            },
        ) {
            inner.order.remove(&previous.tick);
        }
        inner.order.insert(tick, id);

        if inner.entries.len() <= self.capacity {
            return None;
        }

        let evicted = inner.pop_lru();
        if let Some(identity) = &evicted {
            inner.stats.evictions += 1;
            metrics::record_cache_evictions(1);
            debug!(identity_id = %identity.id, label = %identity.label, "Cache evicted LRU identity");
        }
        evicted
    }

    /// Remove every entry whose `last_seen` precedes `cutoff`.
    ///
    /// Returns the number of entries removed.
    pub fn remove_expired(&self, cutoff: DateTime<Utc>) -> usize {
        let mut inner = self.lock();
        let expired: Vec<IdentityId> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.value.last_seen < cutoff)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            inner.remove(id);
        }

        let count = expired.len();
        if count > 0 {
            inner.stats.expired += count as u64;
            metrics::record_cache_expired(count as u64);
            debug!(removed = count, remaining = inner.entries.len(), "Expired cache entries");
        }
        count
    }

    /// Expire entries older than the configured TTL relative to `now`.
    pub fn expire(&self, now: DateTime<Utc>) -> usize {
        self.remove_expired(now - self.ttl)
    }

    pub fn remove(&self, id: &IdentityId) -> Option<TrackedIdentity> {
        self.lock().remove(id)
    }

    /// Copy of every resident identity, most recently used first.
    pub fn snapshot(&self) -> Vec<TrackedIdentity> {
        let inner = self.lock();
        inner
            .order
            .values()
            .rev()
            .filter_map(|id| inner.entries.get(id).map(|e| e.value.clone()))
            .collect()
    }

    /// Keys in recency order, least recently used first.
    pub fn keys_lru(&self) -> Vec<IdentityId> {
        self.lock().order.values().copied().collect()
    }

    /// When an entry was last inserted or read.
    pub fn touched_at(&self, id: &IdentityId) -> Option<DateTime<Utc>> {
        self.lock().entries.get(id).map(|e| e.touched_at)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}

impl Default for ShortTermCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use percept_models::BoundingBox;
    use std::sync::Arc;

    fn identity(last_seen: DateTime<Utc>) -> TrackedIdentity {
        TrackedIdentity {
            id: IdentityId::new(),
            label: "cup".to_string(),
            class_index: 41,
            bounding_box: BoundingBox::new(0.1, 0.1, 0.2, 0.2),
            confidence: 0.7,
            first_seen: last_seen,
            last_seen,
            observations: 1,
            signature: None,
            motion: None,
            last_displacement: None,
            recognized_as: None,
        }
    }

    fn insert(cache: &ShortTermCache, value: TrackedIdentity) -> IdentityId {
        let id = value.id;
        cache.set(id, value);
        id
    }

    #[test]
    fn test_capacity_is_never_exceeded() {
        let cache = ShortTermCache::with_capacity(3, chrono::Duration::seconds(30));
        for _ in 0..10 {
            insert(&cache, identity(Utc::now()));
            assert!(cache.len() <= 3);
        }
        assert_eq!(cache.stats().evictions, 7);
    }

    #[test]
    fn test_least_recently_used_is_evicted() {
        let cache = ShortTermCache::with_capacity(2, chrono::Duration::seconds(30));
        let a = insert(&cache, identity(Utc::now()));
        let b = insert(&cache, identity(Utc::now()));

        // Touch a so b becomes the LRU entry
        assert!(cache.get(&a).is_some());

        let c = identity(Utc::now());
        let c_id = c.id;
        let evicted = cache.set(c_id, c).unwrap();

        assert_eq!(evicted.id, b);
        assert!(cache.peek(&a).is_some());
        assert!(cache.peek(&b).is_none());
        assert_eq!(cache.keys_lru(), vec![a, c_id]);
    }

    #[test]
    fn test_set_refreshes_existing_entry() {
        let cache = ShortTermCache::with_capacity(2, chrono::Duration::seconds(30));
        let mut first = identity(Utc::now());
        let a = insert(&cache, first.clone());
        let b = insert(&cache, identity(Utc::now()));

        first.confidence = 0.9;
        assert!(cache.set(a, first).is_none());
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.keys_lru(), vec![b, a]);
        assert_eq!(cache.peek(&a).unwrap().confidence, 0.9);
    }

    #[test]
    fn test_remove_expired_uses_strict_cutoff() {
        let cache = ShortTermCache::with_capacity(10, chrono::Duration::seconds(30));
        let cutoff = Utc::now();
        let old = insert(&cache, identity(cutoff - chrono::Duration::seconds(5)));
        let exact = insert(&cache, identity(cutoff));
        let fresh = insert(&cache, identity(cutoff + chrono::Duration::seconds(5)));

        assert_eq!(cache.remove_expired(cutoff), 1);
        assert!(cache.peek(&old).is_none());
        assert!(cache.peek(&exact).is_some());
        assert!(cache.peek(&fresh).is_some());
        assert_eq!(cache.stats().expired, 1);
    }

    #[test]
    fn test_expire_applies_ttl() {
        let cache = ShortTermCache::with_capacity(10, chrono::Duration::seconds(30));
        let now = Utc::now();
        insert(&cache, identity(now - chrono::Duration::seconds(31)));
        insert(&cache, identity(now - chrono::Duration::seconds(10)));

        assert_eq!(cache.expire(now), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_access_refreshes_touch_time() {
        let cache = ShortTermCache::default();
        let a = insert(&cache, identity(Utc::now()));
        let inserted = cache.touched_at(&a).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.peek(&a);
        assert_eq!(cache.touched_at(&a), Some(inserted));
        cache.get(&a);
        assert!(cache.touched_at(&a).unwrap() > inserted);
        assert_eq!(cache.touched_at(&IdentityId::new()), None);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = ShortTermCache::default();
        let a = insert(&cache, identity(Utc::now()));
        let b = insert(&cache, identity(Utc::now()));

        assert_eq!(cache.remove(&a).map(|i| i.id), Some(a));
        assert!(cache.remove(&a).is_none());
        assert_eq!(cache.keys_lru(), vec![b]);

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.keys_lru().is_empty());
    }

    #[test]
    fn test_hit_and_miss_counters() {
        let cache = ShortTermCache::default();
        let a = insert(&cache, identity(Utc::now()));
        cache.get(&a);
        cache.get(&IdentityId::new());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_snapshot_is_most_recent_first() {
        let cache = ShortTermCache::default();
        let a = insert(&cache, identity(Utc::now()));
        let b = insert(&cache, identity(Utc::now()));

        let ids: Vec<_> = cache.snapshot().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![b, a]);
    }

    #[test]
    fn test_concurrent_access_respects_capacity() {
        let cache = Arc::new(ShortTermCache::with_capacity(20, chrono::Duration::seconds(30)));

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let value = identity(Utc::now());
                        let id = value.id;
                        cache.set(id, value);
                        cache.get(&id);
                        if (i + worker) % 25 == 0 {
                            cache.remove_expired(Utc::now() - chrono::Duration::seconds(60));
                        }
                        assert!(cache.len() <= 20);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 20);
    }
}
