//! Generic TTL + size-bounded key/value cache.
//!
//! Backs the translation cache and the feed-validation verdict cache. Both
//! bounds are enforced: entries expire after their TTL, and inserting past
//! the capacity evicts the least-recently-used entry. A background sweeper
//! removes expired entries so they do not pin memory until next touched.
//!
//! All state lives behind one internal lock; callers see atomic get/insert
//! semantics and never hold the lock across an await point.

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

struct Inner<K: Hash + Eq, V> {
    entries: LruCache<K, Entry<V>>,
    hits: u64,
    misses: u64,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

/// TTL + LRU bounded cache, cheaply cloneable across tasks.
pub struct TtlCache<K: Hash + Eq, V> {
    inner: Arc<Mutex<Inner<K, V>>>,
    default_ttl: Duration,
}

impl<K: Hash + Eq, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            default_ttl: self.default_ttl,
        }
    }
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    /// Create a cache bounded to `max_size` entries with the given default TTL.
    ///
    /// `max_size` is clamped to at least 1.
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(max_size.max(1)).expect("clamped to >= 1");
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: LruCache::new(cap),
                hits: 0,
                misses: 0,
            })),
            default_ttl,
        }
    }

    /// Look up a key, refreshing its LRU position on hit.
    ///
    /// An expired entry is removed and reported as a miss; a hit is never
    /// returned past its TTL.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let now = Instant::now();
        match inner.entries.get(key) {
            Some(entry) if entry.expires_at > now => {
                let value = entry.value.clone();
                inner.hits += 1;
                Some(value)
            }
            Some(_) => {
                inner.entries.pop(key);
                inner.misses += 1;
                None
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert with the default TTL, evicting the LRU entry if at capacity.
    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    /// Insert with an explicit TTL.
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.put(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Remove all expired entries; returns how many were evicted.
    pub fn sweep(&self) -> usize
    where
        K: Clone,
    {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let now = Instant::now();
        // LruCache has no retain; collect expired keys first
        let expired: Vec<K> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            inner.entries.pop(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().expect("cache lock poisoned").entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache lock poisoned");
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Spawn the background sweep task.
    ///
    /// Runs until the returned handle is aborted (the pipeline aborts it on
    /// shutdown; a dangling sweeper would otherwise keep the cache alive).
    pub fn spawn_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick fires immediately; skip it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = cache.sweep();
                if evicted > 0 {
                    tracing::debug!(evicted = evicted, "Cache sweep removed expired entries");
                }
            }
        })
    }
}
