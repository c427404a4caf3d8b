//! Time-boxed in-memory cache.
//!
//! Foundation for every read path in the sync layer: a `get` within the TTL
//! avoids a network round-trip, a `get` after it returns `None` and evicts
//! the stale entry. Expiry is checked lazily on read; there is no background
//! sweep, which keeps the design free of timer contention.
//!
//! Server-confirmed mutations that make cached data provably stale call
//! [`TtlCache::invalidate`] / [`TtlCache::invalidate_all`] instead of
//! waiting for expiry.

use chat_types::Clock;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::trace;

struct CacheEntry<V> {
    value: V,
    stored_at: DateTime<Utc>,
    ttl: chrono::Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.stored_at) > self.ttl
    }
}

/// Generic key→value store with per-entry expiry.
///
/// Interior mutability lets one instance be shared by reference across the
/// components that own its keys.
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, CacheEntry<V>>>,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Returns the value if present and not expired. An expired entry is
    /// treated as absent and removed.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().expect("lock poisoned");
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                trace!("cache entry expired on read");
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    /// Stores a value with `stored_at = now`. Replaces any previous entry
    /// for the key, fresh or stale.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let entry = CacheEntry {
            value,
            stored_at: self.clock.now(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_default(),
        };
        self.entries
            .lock()
            .expect("lock poisoned")
            .insert(key, entry);
    }

    /// Removes one entry immediately.
    pub fn invalidate(&self, key: &K) {
        self.entries.lock().expect("lock poisoned").remove(key);
    }

    /// Removes every entry whose key matches the predicate.
    pub fn invalidate_all(&self, predicate: impl Fn(&K) -> bool) {
        self.entries
            .lock()
            .expect("lock poisoned")
            .retain(|key, _| !predicate(key));
    }

    pub fn clear(&self) {
        self.entries.lock().expect("lock poisoned").clear();
    }

    /// Number of stored entries, counting not-yet-evicted stale ones.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_types::ManualClock;

    fn cache_with_clock() -> (TtlCache<String, u32>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        let cache = TtlCache::new(clock.clone() as Arc<dyn Clock>);
        (cache, clock)
    }

    #[test]
    fn get_within_ttl_hits() {
        let (cache, _clock) = cache_with_clock();
        cache.set("k".to_string(), 7, Duration::from_secs(60));
        assert_eq!(cache.get(&"k".to_string()), Some(7));
    }

    #[test]
    fn get_after_ttl_misses_and_evicts() {
        let (cache, clock) = cache_with_clock();
        cache.set("k".to_string(), 7, Duration::from_secs(60));

        clock.advance(Duration::from_secs(70));

        assert_eq!(cache.get(&"k".to_string()), None);
        // The stale entry was removed, not just hidden.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn get_exactly_at_ttl_still_hits() {
        let (cache, clock) = cache_with_clock();
        cache.set("k".to_string(), 1, Duration::from_secs(60));
        clock.advance(Duration::from_secs(60));
        // Expiry is strict: now - stored_at must exceed the TTL.
        assert_eq!(cache.get(&"k".to_string()), Some(1));
    }

    #[test]
    fn set_resets_stored_at() {
        let (cache, clock) = cache_with_clock();
        cache.set("k".to_string(), 1, Duration::from_secs(60));
        clock.advance(Duration::from_secs(50));
        cache.set("k".to_string(), 2, Duration::from_secs(60));
        clock.advance(Duration::from_secs(50));
        // 100s since the first set, but only 50s since the second.
        assert_eq!(cache.get(&"k".to_string()), Some(2));
    }

    #[test]
    fn invalidate_removes_immediately() {
        let (cache, _clock) = cache_with_clock();
        cache.set("k".to_string(), 1, Duration::from_secs(60));
        cache.invalidate(&"k".to_string());
        assert_eq!(cache.get(&"k".to_string()), None);
    }

    #[test]
    fn invalidate_all_by_predicate() {
        let (cache, _clock) = cache_with_clock();
        cache.set("conv:1".to_string(), 1, Duration::from_secs(60));
        cache.set("conv:2".to_string(), 2, Duration::from_secs(60));
        cache.set("profile:9".to_string(), 9, Duration::from_secs(60));

        cache.invalidate_all(|key| key.starts_with("conv:"));

        assert_eq!(cache.get(&"conv:1".to_string()), None);
        assert_eq!(cache.get(&"conv:2".to_string()), None);
        assert_eq!(cache.get(&"profile:9".to_string()), Some(9));
    }

    #[test]
    fn per_entry_ttls_are_independent() {
        let (cache, clock) = cache_with_clock();
        cache.set("short".to_string(), 1, Duration::from_secs(10));
        cache.set("long".to_string(), 2, Duration::from_secs(300));

        clock.advance(Duration::from_secs(30));

        assert_eq!(cache.get(&"short".to_string()), None);
        assert_eq!(cache.get(&"long".to_string()), Some(2));
    }

    #[test]
    fn clear_empties_cache() {
        let (cache, _clock) = cache_with_clock();
        cache.set("a".to_string(), 1, Duration::from_secs(60));
        cache.set("b".to_string(), 2, Duration::from_secs(60));
        cache.clear();
        assert!(cache.is_empty());
    }
}
