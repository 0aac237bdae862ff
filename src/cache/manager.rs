//! Two-level cache composition with read-through and protection.
//!
//! Read path: L1 → L2 → storage, with at most one in-flight storage fetch per
//! key process-wide. Concurrent callers for the same key subscribe to the
//! leader's broadcast channel instead of issuing their own fetch. A confirmed
//! absence is cached as a negative entry with a shorter TTL than positive
//! entries, and every TTL is jittered ±10% so hot keys never expire in
//! lockstep.
//!
//! Write path: the store write happens first; only a successful write
//! invalidates L1 and L2.
//!
//! Locking discipline: the singleflight map lock and the L1 shard locks are
//! never held across an L2 or storage call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use middleware_cache_core::{CacheStats, ShardedCache, ShardedCacheConfig};
use rand::Rng;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::storage::Storage;
use crate::types::{MiddlewareError, Result};

use super::l2::{L2Cache, L2Stats};

/// Configuration for the [`CacheManager`].
#[derive(Debug, Clone)]
pub struct CacheManagerConfig {
    pub l1: ShardedCacheConfig,
    /// TTL for values that exist in storage.
    pub positive_ttl: Duration,
    /// TTL for confirmed absences. Must be shorter than `positive_ttl`.
    pub negative_ttl: Duration,
}

impl Default for CacheManagerConfig {
    fn default() -> Self {
        Self {
            l1: ShardedCacheConfig::default(),
            positive_ttl: Duration::from_secs(300),
            negative_ttl: Duration::from_secs(30),
        }
    }
}

/// Counters exposed by `protection_stats()`.
#[derive(Debug, Clone, Serialize)]
pub struct ProtectionStats {
    pub hit: u64,
    pub miss: u64,
    pub negative_hit: u64,
    pub singleflight_coalesced: u64,
    pub l2_fallbacks: u64,
    pub breaker_trips: u64,
}

/// L1 entry: `None` bytes mark a confirmed absence.
#[derive(Clone)]
struct CachedValue {
    bytes: Option<Vec<u8>>,
}

/// Outcome broadcast from a singleflight leader to its followers. Errors
/// travel as strings because broadcast payloads must be `Clone`.
type FetchOutcome = std::result::Result<Option<Vec<u8>>, String>;

/// L1/L2/storage composition. One instance per process.
pub struct CacheManager {
    l1: ShardedCache<CachedValue>,
    l2: L2Cache,
    storage: Arc<dyn Storage>,
    in_flight: Mutex<HashMap<String, broadcast::Sender<FetchOutcome>>>,
    config: CacheManagerConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    negative_hits: AtomicU64,
    coalesced: AtomicU64,
    l2_fallbacks: AtomicU64,
}

impl CacheManager {
    pub fn new(config: CacheManagerConfig, l2: L2Cache, storage: Arc<dyn Storage>) -> Self {
        Self {
            l1: ShardedCache::new(config.l1.clone()),
            l2,
            storage,
            in_flight: Mutex::new(HashMap::new()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            negative_hits: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            l2_fallbacks: AtomicU64::new(0),
        }
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Read through the tiers. `Ok(None)` means the key is confirmed absent.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(cached) = self.l1.get(key) {
            return Ok(match cached.bytes {
                Some(bytes) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Some(bytes)
                }
                None => {
                    self.negative_hits.fetch_add(1, Ordering::Relaxed);
                    None
                }
            });
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        // Singleflight: one leader fetches, everyone else subscribes.
        enum Flight {
            Leader(broadcast::Sender<FetchOutcome>),
            Follower(broadcast::Receiver<FetchOutcome>),
        }
        let flight = {
            let mut in_flight = self.in_flight.lock().expect("singleflight mutex poisoned");
            match in_flight.get(key) {
                Some(tx) => Flight::Follower(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    in_flight.insert(key.to_string(), tx.clone());
                    Flight::Leader(tx)
                }
            }
        };

        match flight {
            Flight::Follower(mut rx) => {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(key, "coalesced onto in-flight fetch");
                match rx.recv().await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(message)) => Err(MiddlewareError::Internal(message)),
                    Err(_) => Err(MiddlewareError::Internal(format!(
                        "singleflight leader vanished for {key}"
                    ))),
                }
            }
            Flight::Leader(tx) => {
                let outcome = self.fetch_and_populate(key).await;

                // Remove the entry and publish under the same lock so a
                // racing subscriber either receives this result or becomes
                // the next leader.
                let broadcast_outcome: FetchOutcome = match &outcome {
                    Ok(value) => Ok(value.clone()),
                    Err(e) => Err(e.to_string()),
                };
                {
                    let mut in_flight =
                        self.in_flight.lock().expect("singleflight mutex poisoned");
                    in_flight.remove(key);
                    let _ = tx.send(broadcast_outcome);
                }
                outcome
            }
        }
    }

    /// L2 then storage, populating tiers on the way back.
    async fn fetch_and_populate(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.l2_get_with_retry(key).await {
            Ok(Some(bytes)) => {
                self.l1.set(
                    key,
                    CachedValue {
                        bytes: Some(bytes.clone()),
                    },
                    Some(self.jittered(self.config.positive_ttl)),
                );
                return Ok(Some(bytes));
            }
            Ok(None) => {}
            Err(e) => {
                self.l2_fallbacks.fetch_add(1, Ordering::Relaxed);
                debug!(key, error = %e, "l2 unavailable, falling back to storage");
            }
        }

        let fetched = self.storage_get_with_retry(key).await?;
        match fetched {
            Some(bytes) => {
                let ttl = self.jittered(self.config.positive_ttl);
                if let Err(e) = self.l2.set(key, bytes.clone(), ttl).await {
                    debug!(key, error = %e, "l2 backfill skipped");
                }
                self.l1.set(
                    key,
                    CachedValue {
                        bytes: Some(bytes.clone()),
                    },
                    Some(ttl),
                );
                Ok(Some(bytes))
            }
            None => {
                self.l1.set(
                    key,
                    CachedValue { bytes: None },
                    Some(self.jittered(self.config.negative_ttl)),
                );
                debug!(key, "cached negative entry");
                Ok(None)
            }
        }
    }

    async fn l2_get_with_retry(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.l2.get(key).await {
            Err(e) if e.is_transient() && !matches!(e, MiddlewareError::BreakerOpen(_)) => {
                tokio::time::sleep(backoff_with_jitter(0)).await;
                self.l2.get(key).await
            }
            other => other,
        }
    }

    async fn storage_get_with_retry(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.storage.get(key).await {
            Err(e) if e.is_transient() => {
                tokio::time::sleep(backoff_with_jitter(0)).await;
                self.storage.get(key).await
            }
            other => other,
        }
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Write through to storage, then invalidate both cache tiers. A failed
    /// store write leaves the caches untouched.
    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.storage.put(key, value).await?;
        self.invalidate(key).await;
        Ok(())
    }

    /// Delete from storage, then invalidate both cache tiers.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.storage.delete(key).await?;
        self.invalidate(key).await;
        Ok(())
    }

    /// Enumerate storage keys under a prefix. Listings are not cached; they
    /// exist so handlers stay decoupled from the storage adapter.
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.storage.list(prefix).await
    }

    /// Drop a key from L1 and L2 without touching storage.
    pub async fn invalidate(&self, key: &str) {
        self.l1.delete(key);
        if let Err(e) = self.l2.delete(key).await {
            warn!(key, error = %e, "l2 invalidation failed; entry expires by ttl");
        }
    }

    // ------------------------------------------------------------------
    // Warmup and stats
    // ------------------------------------------------------------------

    /// Fetch and populate the given keys. Returns how many resolved to a
    /// value.
    pub async fn warmup(&self, keys: &[String]) -> usize {
        let mut warmed = 0;
        for key in keys {
            match self.get(key).await {
                Ok(Some(_)) => warmed += 1,
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "warmup fetch failed"),
            }
        }
        info!(requested = keys.len(), warmed, "cache warmup finished");
        warmed
    }

    pub fn protection_stats(&self) -> ProtectionStats {
        ProtectionStats {
            hit: self.hits.load(Ordering::Relaxed),
            miss: self.misses.load(Ordering::Relaxed),
            negative_hit: self.negative_hits.load(Ordering::Relaxed),
            singleflight_coalesced: self.coalesced.load(Ordering::Relaxed),
            l2_fallbacks: self.l2_fallbacks.load(Ordering::Relaxed),
            breaker_trips: self.l2.breaker_trips(),
        }
    }

    pub fn l1_stats(&self) -> CacheStats {
        self.l1.stats()
    }

    pub fn l2_stats(&self) -> L2Stats {
        self.l2.stats()
    }

    /// Sweep expired L1 entries. Driven by the periodic sweeper task.
    pub fn purge_expired(&self) -> usize {
        self.l1.purge_expired()
    }

    fn jittered(&self, base: Duration) -> Duration {
        jittered_ttl(base)
    }
}

/// Apply ±10% jitter so cached entries never expire in lockstep.
fn jittered_ttl(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    base.mul_f64(factor)
}

/// Full-jitter exponential backoff for single retries of transient failures.
fn backoff_with_jitter(attempt: u32) -> Duration {
    let cap_ms = 50u64.saturating_mul(2u64.saturating_pow(attempt)).min(1_000);
    Duration::from_millis(rand::thread_rng().gen_range(0..=cap_ms))
}

/// Spawn a background task that periodically sweeps expired L1 entries.
pub fn spawn_l1_sweeper(manager: Arc<CacheManager>, interval: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            let purged = manager.purge_expired();
            if purged > 0 {
                debug!(purged, "l1 sweeper removed expired entries");
            }
        }
    });
    info!(interval_secs = interval.as_secs(), "l1 sweeper started");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::l2::{InMemoryRemoteCache, L2Config, RemoteCache};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Storage that counts gets and can delay them.
    struct CountingStorage {
        inner: MemoryStorage,
        gets: AtomicUsize,
        delay: Duration,
    }

    impl CountingStorage {
        fn new(delay: Duration) -> Self {
            Self {
                inner: MemoryStorage::new(),
                gets: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl Storage for CountingStorage {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
            self.inner.put(key, value).await
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.inner.delete(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix).await
        }
    }

    fn manager_with(storage: Arc<dyn Storage>) -> CacheManager {
        CacheManager::new(
            CacheManagerConfig {
                l1: ShardedCacheConfig::default(),
                positive_ttl: Duration::from_secs(300),
                negative_ttl: Duration::from_secs(30),
            },
            L2Cache::new(Arc::new(InMemoryRemoteCache::new()), L2Config::default()),
            storage,
        )
    }

    #[tokio::test]
    async fn test_singleflight_coalesces_hundred_readers() {
        let storage = Arc::new(CountingStorage::new(Duration::from_millis(50)));
        storage
            .inner
            .put("user:game1:42", b"V".to_vec())
            .await
            .expect("seed");
        let manager = Arc::new(manager_with(Arc::clone(&storage) as Arc<dyn Storage>));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager.get("user:game1:42").await.expect("get")
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.expect("join"), Some(b"V".to_vec()));
        }

        assert_eq!(storage.gets.load(Ordering::SeqCst), 1, "one fetch for all callers");
        let stats = manager.protection_stats();
        assert!(stats.singleflight_coalesced > 0);
        assert!(stats.singleflight_coalesced <= 99);
    }

    #[tokio::test]
    async fn test_negative_cache_short_circuits_storage() {
        let storage = Arc::new(CountingStorage::new(Duration::ZERO));
        let manager = manager_with(Arc::clone(&storage) as Arc<dyn Storage>);

        assert_eq!(manager.get("user:game1:missing").await.expect("get"), None);
        assert_eq!(storage.gets.load(Ordering::SeqCst), 1);

        // Within negative_ttl the absence is served from L1.
        assert_eq!(manager.get("user:game1:missing").await.expect("get"), None);
        assert_eq!(storage.gets.load(Ordering::SeqCst), 1);
        assert_eq!(manager.protection_stats().negative_hit, 1);

        // A positive write retires the negative entry immediately.
        manager
            .put("user:game1:missing", b"V".to_vec())
            .await
            .expect("put");
        assert_eq!(
            manager.get("user:game1:missing").await.expect("get"),
            Some(b"V".to_vec())
        );
    }

    #[tokio::test]
    async fn test_write_then_read_observes_new_value() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = manager_with(storage as Arc<dyn Storage>);

        manager.put("k", b"one".to_vec()).await.expect("put");
        assert_eq!(manager.get("k").await.expect("get"), Some(b"one".to_vec()));

        manager.put("k", b"two".to_vec()).await.expect("put");
        assert_eq!(manager.get("k").await.expect("get"), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn test_l2_hit_skips_storage() {
        let storage = Arc::new(CountingStorage::new(Duration::ZERO));
        let l2_client = Arc::new(InMemoryRemoteCache::new());
        l2_client
            .set("k", b"from-l2".to_vec(), Duration::from_secs(60))
            .await
            .expect("seed l2");
        let manager = CacheManager::new(
            CacheManagerConfig::default(),
            L2Cache::new(l2_client, L2Config::default()),
            Arc::clone(&storage) as Arc<dyn Storage>,
        );

        assert_eq!(manager.get("k").await.expect("get"), Some(b"from-l2".to_vec()));
        assert_eq!(storage.gets.load(Ordering::SeqCst), 0);

        // Now resident in L1.
        assert_eq!(manager.get("k").await.expect("get"), Some(b"from-l2".to_vec()));
        assert_eq!(manager.protection_stats().hit, 1);
    }

    #[tokio::test]
    async fn test_l2_outage_falls_back_to_storage() {
        struct DeadRemote;
        #[async_trait]
        impl RemoteCache for DeadRemote {
            async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
                Err(MiddlewareError::Internal("refused".to_string()))
            }
            async fn set(&self, _key: &str, _v: Vec<u8>, _ttl: Duration) -> Result<()> {
                Err(MiddlewareError::Internal("refused".to_string()))
            }
            async fn delete(&self, _key: &str) -> Result<()> {
                Err(MiddlewareError::Internal("refused".to_string()))
            }
        }

        let storage = Arc::new(MemoryStorage::new());
        storage.put("k", b"V".to_vec()).await.expect("seed");
        let manager = CacheManager::new(
            CacheManagerConfig::default(),
            L2Cache::new(Arc::new(DeadRemote), L2Config::default()),
            storage as Arc<dyn Storage>,
        );

        assert_eq!(manager.get("k").await.expect("get"), Some(b"V".to_vec()));
        assert!(manager.protection_stats().l2_fallbacks >= 1);
    }

    #[tokio::test]
    async fn test_warmup_populates_l1() {
        let storage = Arc::new(CountingStorage::new(Duration::ZERO));
        storage.inner.put("a", b"1".to_vec()).await.expect("seed");
        storage.inner.put("b", b"2".to_vec()).await.expect("seed");
        let manager = manager_with(Arc::clone(&storage) as Arc<dyn Storage>);

        let warmed = manager
            .warmup(&["a".to_string(), "b".to_string(), "gone".to_string()])
            .await;
        assert_eq!(warmed, 2);

        let before = storage.gets.load(Ordering::SeqCst);
        assert_eq!(manager.get("a").await.expect("get"), Some(b"1".to_vec()));
        assert_eq!(storage.gets.load(Ordering::SeqCst), before);
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let base = Duration::from_secs(100);
        for _ in 0..200 {
            let jittered = jittered_ttl(base);
            assert!(jittered >= Duration::from_secs(90));
            assert!(jittered <= Duration::from_secs(110));
        }
    }
}
