//! Bounded, inactivity-expiring lookup cache.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    last_access: Instant,
}

/// LRU cache split into independently locked shards.
///
/// Each entry expires once it has not been read for `ttl`. Capacity is
/// divided evenly between shards, so eviction is approximately LRU overall.
#[derive(Debug)]
pub struct ExpiringCache<K: Hash + Eq, V> {
    shards: Vec<Mutex<LruCache<K, Entry<V>>>>,
    ttl: Duration,
}

impl<K: Hash + Eq, V: Clone> ExpiringCache<K, V> {
    /// Creates a cache holding about `capacity` entries.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let shard_count = SHARD_COUNT.min(capacity.max(1));
        let per_shard = capacity.div_ceil(shard_count).max(1);
        let per_shard = NonZeroUsize::new(per_shard).unwrap_or(NonZeroUsize::MIN);

        Self {
            shards: (0..shard_count)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect(),
            ttl,
        }
    }

    /// Returns the cached value and refreshes its access time.
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    /// Inserts or replaces a value.
    pub fn insert(&self, key: K, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    pub(crate) fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        let mut shard = self.shard(key).lock();
        match shard.get_mut(key) {
            None => return None,
            Some(entry) if now.saturating_duration_since(entry.last_access) < self.ttl => {
                entry.last_access = now;
                return Some(entry.value.clone());
            }
            Some(_) => {}
        }
        shard.pop(key);
        None
    }

    pub(crate) fn insert_at(&self, key: K, value: V, now: Instant) {
        let mut shard = self.shard(&key).lock();
        shard.put(
            key,
            Entry {
                value,
                last_access: now,
            },
        );
    }

    /// Removes every entry.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
    }

    /// Number of cached entries, including ones not yet found expired.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    /// Returns true if the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, key: &K) -> &Mutex<LruCache<K, Entry<V>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.shards.len();
        &self.shards[index]
    }
}
