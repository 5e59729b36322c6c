//! TTL+LRU cache for constructed per-(cluster, user) clients.
//!
//! The key carries the anonymized user hash, never the raw identifier, so no
//! PII enters cache state and log fields, metric labels and cache keys all
//! share the same bucket. Entries expire after a TTL that must stay within
//! the lifetime of the bearer tokens baked into the cached clients.
//!
//! One reader-writer mutex protects the map and the LRU order list; it is
//! held only for in-memory updates and values are cloned out, so no lock is
//! ever held across a network call.
use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use parking_lot::RwLock;

use crate::metrics;

/// Cache key: cluster name plus anonymized caller hash.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Target cluster name.
    pub cluster: String,
    /// Anonymized caller identifier, from [`crate::identity::anonymize`].
    pub user_hash: String,
}

impl CacheKey {
    /// Construct a key from a cluster name and a pre-anonymized user hash.
    pub fn new(cluster: impl Into<String>, user_hash: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            user_hash: user_hash.into(),
        }
    }
}

struct Entry<T> {
    value: T,
    inserted: Instant,
    last_access: Instant,
}

struct Inner<T> {
    entries: HashMap<CacheKey, Entry<T>>,
    // Front is least recently used. Kept strictly in sync with `entries`.
    order: VecDeque<CacheKey>,
}

/// Thread-safe TTL+LRU cache keyed by (cluster, user hash).
///
/// Generic over the cached handle; the broker stores [`kube::Client`]s.
///
/// ```
/// use std::time::Duration;
/// use kube_broker::{CacheKey, ClientCache};
///
/// let cache: ClientCache<u32> = ClientCache::new(Duration::from_secs(60), 16);
/// cache.put(CacheKey::new("prod-eu", "user:00aabb"), 1);
/// assert_eq!(cache.get(&CacheKey::new("prod-eu", "user:00aabb")), Some(1));
/// assert_eq!(cache.get(&CacheKey::new("prod-eu", "user:ffeedd")), None);
/// ```
pub struct ClientCache<T> {
    ttl: Duration,
    max_entries: usize,
    inner: RwLock<Inner<T>>,
}

impl<T: Clone> ClientCache<T> {
    /// Create a cache with the given entry lifetime and capacity.
    ///
    /// A capacity of zero disables caching: every `put` is dropped and every
    /// `get` misses.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Look up a live entry, refreshing its recency.
    ///
    /// An entry at or past its TTL is evicted (reason `expired`) and
    /// reported as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<T> {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        match inner.entries.get_mut(key) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => {
                entry.last_access = Instant::now();
                let value = entry.value.clone();
                move_to_back(&mut inner.order, key);
                metrics::record_cache_hit(&key.cluster);
                Some(value)
            }
            Some(_) => {
                inner.entries.remove(key);
                remove_from_order(&mut inner.order, key);
                metrics::record_cache_eviction("expired");
                metrics::record_cache_size(inner.entries.len());
                metrics::record_cache_miss(&key.cluster);
                None
            }
            None => {
                metrics::record_cache_miss(&key.cluster);
                None
            }
        }
    }

    /// Insert an entry, evicting the least recently used one on overflow
    /// (reason `capacity`).
    pub fn put(&self, key: CacheKey, value: T) {
        if self.max_entries == 0 {
            return;
        }
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let now = Instant::now();
        if inner.entries.contains_key(&key) {
            move_to_back(&mut inner.order, &key);
        } else {
            if inner.entries.len() >= self.max_entries {
                if let Some(victim) = inner.order.pop_front() {
                    inner.entries.remove(&victim);
                    metrics::record_cache_eviction("capacity");
                }
            }
            inner.order.push_back(key.clone());
        }
        inner.entries.insert(
            key,
            Entry {
                value,
                inserted: now,
                last_access: now,
            },
        );
        metrics::record_cache_size(inner.entries.len());
    }

    /// Remove one entry (reason `manual`). Returns whether it existed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let existed = inner.entries.remove(key).is_some();
        if existed {
            remove_from_order(&mut inner.order, key);
            metrics::record_cache_eviction("manual");
            metrics::record_cache_size(inner.entries.len());
        }
        existed
    }

    /// Remove every entry for a cluster (reason `manual`), e.g. after its
    /// credentials rotated. Returns the number of removed entries.
    pub fn invalidate_cluster(&self, cluster: &str) -> usize {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let before = inner.entries.len();
        inner.entries.retain(|key, _| key.cluster != cluster);
        inner.order.retain(|key| key.cluster != cluster);
        let removed = before - inner.entries.len();
        for _ in 0..removed {
            metrics::record_cache_eviction("manual");
        }
        metrics::record_cache_size(inner.entries.len());
        removed
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn move_to_back(order: &mut VecDeque<CacheKey>, key: &CacheKey) {
    remove_from_order(order, key);
    order.push_back(key.clone());
}

fn remove_from_order(order: &mut VecDeque<CacheKey>, key: &CacheKey) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        order.remove(pos);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(cluster: &str, user: &str) -> CacheKey {
        CacheKey::new(cluster, crate::identity::anonymize(user))
    }

    #[test]
    fn entries_are_isolated_per_user() {
        let cache = ClientCache::new(Duration::from_secs(60), 10);
        cache.put(key("prod-eu", "alice@example.com"), 1);
        assert_eq!(cache.get(&key("prod-eu", "alice@example.com")), Some(1));
        assert_eq!(cache.get(&key("prod-eu", "bob@example.com")), None);
    }

    #[test]
    fn entries_are_isolated_per_cluster() {
        let cache = ClientCache::new(Duration::from_secs(60), 10);
        cache.put(key("prod-eu", "alice@example.com"), 1);
        assert_eq!(cache.get(&key("prod-us", "alice@example.com")), None);
    }

    #[test]
    fn expired_entries_miss() {
        let cache = ClientCache::new(Duration::ZERO, 10);
        cache.put(key("prod-eu", "alice@example.com"), 1);
        assert_eq!(cache.get(&key("prod-eu", "alice@example.com")), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = ClientCache::new(Duration::from_secs(60), 2);
        let a = key("a", "alice@example.com");
        let b = key("b", "alice@example.com");
        let c = key("c", "alice@example.com");
        cache.put(a.clone(), 1);
        cache.put(b.clone(), 2);
        // Touch `a` so `b` becomes the LRU victim.
        assert_eq!(cache.get(&a), Some(1));
        cache.put(c.clone(), 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&b), None);
        assert_eq!(cache.get(&a), Some(1));
        assert_eq!(cache.get(&c), Some(3));
    }

    #[test]
    fn reinsert_replaces_without_growth() {
        let cache = ClientCache::new(Duration::from_secs(60), 2);
        let a = key("a", "alice@example.com");
        cache.put(a.clone(), 1);
        cache.put(a.clone(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&a), Some(2));
    }

    #[test]
    fn manual_invalidation_removes_one_entry() {
        let cache = ClientCache::new(Duration::from_secs(60), 10);
        let a = key("prod-eu", "alice@example.com");
        cache.put(a.clone(), 1);
        assert!(cache.invalidate(&a));
        assert!(!cache.invalidate(&a));
        assert_eq!(cache.get(&a), None);
    }

    #[test]
    fn cluster_invalidation_removes_all_users_of_that_cluster() {
        let cache = ClientCache::new(Duration::from_secs(60), 10);
        cache.put(key("prod-eu", "alice@example.com"), 1);
        cache.put(key("prod-eu", "bob@example.com"), 2);
        cache.put(key("prod-us", "alice@example.com"), 3);
        assert_eq!(cache.invalidate_cluster("prod-eu"), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key("prod-us", "alice@example.com")), Some(3));
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let cache = ClientCache::new(Duration::from_secs(60), 0);
        let a = key("prod-eu", "alice@example.com");
        cache.put(a.clone(), 1);
        assert_eq!(cache.get(&a), None);
        assert!(cache.is_empty());
    }
}
