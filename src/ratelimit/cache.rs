//! A small TTL-keyed object cache.
//!
//! Holds per-key local limiter state alive for as long as it matters.
//! Expired entries are dropped when touched, and a sweep over the whole map
//! runs every [`SWEEP_EVERY`] insertions so keys that are never seen again
//! do not accumulate.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::Clock;

/// Number of insertions between full sweeps of expired entries.
const SWEEP_EVERY: usize = 256;

struct Entry<V> {
    value: V,
    expires_at: Duration,
}

struct Inner<K, V> {
    entries: HashMap<K, Entry<V>>,
    inserts_since_sweep: usize,
}

/// Map from key to value where every entry carries an expiry.
pub struct TtlCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                inserts_since_sweep: 0,
            }),
            clock,
        }
    }

    /// Get a live value for `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                inner.entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store `value` for `key`, replacing anything already there.
    pub fn put(&self, key: K, value: V, ttl: Duration) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.entries.insert(
            key,
            Entry {
                value,
                expires_at: now.saturating_add(ttl),
            },
        );
        Self::note_insert(&mut inner, now);
    }

    /// Return the live value for `key`, creating it with `init` on a miss.
    ///
    /// Lookup and creation happen under one lock, so concurrent callers on a
    /// new key all end up with the same value. A hit pushes the expiry out
    /// to at least `ttl` from now.
    pub fn get_or_insert_with<F>(&self, key: &K, ttl: Duration, init: F) -> V
    where
        F: FnOnce() -> V,
    {
        let now = self.clock.now();
        let expires_at = now.saturating_add(ttl);
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.entries.get_mut(key) {
            if entry.expires_at > now {
                entry.expires_at = entry.expires_at.max(expires_at);
                return entry.value.clone();
            }
        }

        let value = init();
        inner.entries.insert(
            key.clone(),
            Entry {
                value: value.clone(),
                expires_at,
            },
        );
        Self::note_insert(&mut inner, now);
        value
    }

    /// Keep `key` alive for at least `ttl` from now. Missing keys are ignored.
    pub fn extend(&self, key: &K, ttl: Duration) {
        let expires_at = self.clock.now().saturating_add(ttl);
        if let Some(entry) = self.inner.lock().entries.get_mut(key) {
            entry.expires_at = entry.expires_at.max(expires_at);
        }
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        Self::sweep(&mut inner, now)
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn note_insert(inner: &mut Inner<K, V>, now: Duration) {
        inner.inserts_since_sweep += 1;
        if inner.inserts_since_sweep >= SWEEP_EVERY {
            Self::sweep(inner, now);
        }
    }

    fn sweep(inner: &mut Inner<K, V>, now: Duration) -> usize {
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.expires_at > now);
        inner.inserts_since_sweep = 0;
        before - inner.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache() -> (TtlCache<String, u32>, ManualClock) {
        let clock = ManualClock::starting_at(Duration::from_secs(1));
        (TtlCache::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_put_and_expire() {
        let (cache, clock) = cache();
        cache.put("a".to_string(), 1, Duration::from_secs(2));

        assert_eq!(cache.get(&"a".to_string()), Some(1));

        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get(&"a".to_string()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_get_or_insert_reuses_live_value() {
        let (cache, clock) = cache();
        let key = "k".to_string();

        assert_eq!(cache.get_or_insert_with(&key, Duration::from_secs(1), || 7), 7);
        assert_eq!(cache.get_or_insert_with(&key, Duration::from_secs(1), || 8), 7);

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get_or_insert_with(&key, Duration::from_secs(1), || 9), 9);
    }

    #[test]
    fn test_access_refreshes_expiry() {
        let (cache, clock) = cache();
        let key = "k".to_string();

        cache.get_or_insert_with(&key, Duration::from_secs(2), || 1);
        clock.advance(Duration::from_millis(1500));
        cache.get_or_insert_with(&key, Duration::from_secs(2), || 2);
        clock.advance(Duration::from_millis(1500));

        assert_eq!(cache.get(&key), Some(1));
    }

    #[test]
    fn test_extend() {
        let (cache, clock) = cache();
        let key = "k".to_string();

        cache.put(key.clone(), 1, Duration::from_secs(1));
        cache.extend(&key, Duration::from_secs(5));
        clock.advance(Duration::from_secs(3));

        assert_eq!(cache.get(&key), Some(1));

        // Extending never shortens.
        cache.extend(&key, Duration::from_millis(1));
        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get(&key), Some(1));
    }

    #[test]
    fn test_purge_expired() {
        let (cache, clock) = cache();
        cache.put("short".to_string(), 1, Duration::from_secs(1));
        cache.put("long".to_string(), 2, Duration::from_secs(10));

        clock.advance(Duration::from_secs(2));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"long".to_string()), Some(2));
    }

    #[test]
    fn test_periodic_sweep_on_insert() {
        let (cache, clock) = cache();
        for i in 0..(SWEEP_EVERY - 1) {
            cache.put(format!("old-{}", i), 0, Duration::from_secs(1));
        }
        clock.advance(Duration::from_secs(5));

        // This insertion triggers the sweep.
        cache.put("fresh".to_string(), 1, Duration::from_secs(1));
        assert_eq!(cache.len(), 1);
    }
}
