//! Sharded in-process cache with TTL expiry and O(log n) LRU eviction.
//!
//! The cache is split into a power-of-two number of shards. Each shard owns an
//! independent lock, a key map, and a `BTreeMap` recency index keyed by a
//! monotonic access tick, so eviction pops the least-recently-used entry
//! without scanning the shard.
//!
//! Locks are plain `std::sync::Mutex`es and every operation completes without
//! awaiting: callers can rely on a shard lock never being held across I/O.
//!
//! Expiry is lazy on read; `purge_expired` exists for a periodic sweeper owned
//! by the embedding process.

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for [`ShardedCache`].
#[derive(Debug, Clone)]
pub struct ShardedCacheConfig {
    /// Number of shards. Rounded up to the next power of two.
    pub shard_count: usize,
    /// Hard cap on entries per shard; the LRU tail is evicted beyond this.
    pub max_entries_per_shard: usize,
}

impl Default for ShardedCacheConfig {
    fn default() -> Self {
        Self {
            shard_count: 16,
            max_entries_per_shard: 4096,
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Immutable snapshot of cache counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Entries currently resident across all shards.
    pub item_count: usize,
    /// Number of shards.
    pub shard_count: usize,
    /// Per-shard entry cap.
    pub max_entries_per_shard: usize,
    /// Reads that found a live entry.
    pub hits: u64,
    /// Reads that found nothing (or only an expired entry).
    pub misses: u64,
    /// Entries removed to enforce the per-shard cap.
    pub evictions: u64,
    /// Entries removed because their TTL elapsed.
    pub expirations: u64,
}

impl CacheStats {
    /// Hit rate as a percentage of all reads.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

// ============================================================================
// Shard internals
// ============================================================================

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
    last_accessed: u64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if now >= at)
    }
}

struct Shard<V> {
    entries: HashMap<String, Entry<V>>,
    /// Recency index: access tick → key. Ticks are unique process-wide, so a
    /// plain map suffices and the first key is always the LRU entry.
    by_access: BTreeMap<u64, String>,
}

impl<V> Shard<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            by_access: BTreeMap::new(),
        }
    }

    fn remove(&mut self, key: &str) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.by_access.remove(&entry.last_accessed);
        Some(entry)
    }

    fn touch(&mut self, key: &str, tick: u64) {
        if let Some(entry) = self.entries.get_mut(key) {
            self.by_access.remove(&entry.last_accessed);
            entry.last_accessed = tick;
            self.by_access.insert(tick, key.to_string());
        }
    }

    /// Pop the least-recently-used entry. O(log n).
    fn pop_lru(&mut self) -> Option<String> {
        let (&tick, _) = self.by_access.iter().next()?;
        let key = self.by_access.remove(&tick)?;
        self.entries.remove(&key);
        Some(key)
    }
}

// ============================================================================
// Sharded cache
// ============================================================================

/// Thread-safe sharded TTL/LRU cache.
///
/// Values must be `Clone`; reads hand out clones so no entry reference ever
/// escapes a shard lock.
pub struct ShardedCache<V> {
    shards: Vec<Mutex<Shard<V>>>,
    mask: usize,
    max_entries_per_shard: usize,
    access_tick: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<V: Clone> ShardedCache<V> {
    /// Create a cache from configuration. Shard count is rounded up to a
    /// power of two so the shard selector is a mask, not a modulo.
    pub fn new(config: ShardedCacheConfig) -> Self {
        let shard_count = config.shard_count.max(1).next_power_of_two();
        if shard_count != config.shard_count {
            warn!(
                requested = config.shard_count,
                effective = shard_count,
                "shard count rounded up to power of two"
            );
        }
        let shards = (0..shard_count).map(|_| Mutex::new(Shard::new())).collect();
        Self {
            shards,
            mask: shard_count - 1,
            max_entries_per_shard: config.max_entries_per_shard.max(1),
            access_tick: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Create a cache with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ShardedCacheConfig::default())
    }

    fn shard_for(&self, key: &str) -> &Mutex<Shard<V>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & self.mask]
    }

    fn next_tick(&self) -> u64 {
        self.access_tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a key. Expired entries are dropped on the spot and count as a
    /// miss plus an expiration.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let tick = self.next_tick();
        let mut shard = self.shard_for(key).lock().expect("cache shard poisoned");

        enum Lookup {
            Hit,
            Expired,
            Miss,
        }
        let lookup = match shard.entries.get(key) {
            Some(entry) if entry.is_expired(now) => Lookup::Expired,
            Some(_) => Lookup::Hit,
            None => Lookup::Miss,
        };

        match lookup {
            Lookup::Hit => {
                shard.touch(key, tick);
                let value = shard.entries.get(key).map(|e| e.value.clone());
                self.hits.fetch_add(1, Ordering::Relaxed);
                value
            }
            Lookup::Expired => {
                shard.remove(key);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Lookup::Miss => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace a key. `ttl = None` means no expiry. Evicts the LRU
    /// tail if the shard is at its cap.
    pub fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let now = Instant::now();
        let tick = self.next_tick();
        let mut shard = self.shard_for(key).lock().expect("cache shard poisoned");

        shard.remove(key);
        while shard.entries.len() >= self.max_entries_per_shard {
            match shard.pop_lru() {
                Some(evicted) => {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %evicted, "evicted LRU entry");
                }
                None => break,
            }
        }

        shard.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|t| now + t),
                last_accessed: tick,
            },
        );
        shard.by_access.insert(tick, key.to_string());
    }

    /// Remove a key. Returns true if it was present.
    pub fn delete(&self, key: &str) -> bool {
        let mut shard = self.shard_for(key).lock().expect("cache shard poisoned");
        shard.remove(key).is_some()
    }

    /// Drop every entry in every shard.
    pub fn clear(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock().expect("cache shard poisoned");
            shard.entries.clear();
            shard.by_access.clear();
        }
    }

    /// Remove expired entries from all shards. Returns the number removed.
    /// Intended to be driven by a periodic sweeper task.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().expect("cache shard poisoned");
            let dead: Vec<String> = shard
                .entries
                .iter()
                .filter(|(_, e)| e.is_expired(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in dead {
                shard.remove(&key);
                purged += 1;
            }
        }
        if purged > 0 {
            self.expirations.fetch_add(purged as u64, Ordering::Relaxed);
            debug!(purged, "swept expired cache entries");
        }
        purged
    }

    /// Total live entries across shards.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().expect("cache shard poisoned").entries.len())
            .sum()
    }

    /// True when no shard holds an entry.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the cache counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            item_count: self.len(),
            shard_count: self.shards.len(),
            max_entries_per_shard: self.max_entries_per_shard,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache() -> ShardedCache<Vec<u8>> {
        ShardedCache::new(ShardedCacheConfig {
            shard_count: 1,
            max_entries_per_shard: 3,
        })
    }

    #[test]
    fn test_set_get_delete() {
        let cache = ShardedCache::with_defaults();
        assert!(cache.get("k").is_none());

        cache.set("k", vec![1u8, 2, 3], None);
        assert_eq!(cache.get("k"), Some(vec![1, 2, 3]));

        assert!(cache.delete("k"));
        assert!(!cache.delete("k"));
        assert!(cache.get("k").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn test_ttl_expiry_is_lazy() {
        let cache = ShardedCache::with_defaults();
        cache.set("k", vec![9u8], Some(Duration::from_millis(5)));
        std::thread::sleep(Duration::from_millis(20));

        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_lru_eviction_at_cap() {
        let cache = small_cache();
        cache.set("a", vec![1], None);
        cache.set("b", vec![2], None);
        cache.set("c", vec![3], None);

        // Touch "a" so "b" becomes the LRU entry.
        assert!(cache.get("a").is_some());

        cache.set("d", vec![4], None);
        assert_eq!(cache.len(), 3);
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert!(cache.get("d").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_replace_does_not_grow() {
        let cache = small_cache();
        cache.set("a", vec![1], None);
        cache.set("a", vec![2], None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a"), Some(vec![2]));
    }

    #[test]
    fn test_purge_expired_sweeps_all_shards() {
        let cache = ShardedCache::new(ShardedCacheConfig {
            shard_count: 8,
            max_entries_per_shard: 64,
        });
        for i in 0..32 {
            cache.set(&format!("k{i}"), vec![i as u8], Some(Duration::from_millis(1)));
        }
        for i in 0..32 {
            cache.set(&format!("live{i}"), vec![i as u8], None);
        }
        std::thread::sleep(Duration::from_millis(10));

        assert_eq!(cache.purge_expired(), 32);
        assert_eq!(cache.len(), 32);
    }

    #[test]
    fn test_shard_count_rounds_to_power_of_two() {
        let cache: ShardedCache<u8> = ShardedCache::new(ShardedCacheConfig {
            shard_count: 5,
            max_entries_per_shard: 10,
        });
        assert_eq!(cache.stats().shard_count, 8);
    }
}
