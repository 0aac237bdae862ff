//! Keyed collection of worker pools, one per task class.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::types::{MiddlewareError, Result};

use super::{PoolConfig, PoolStats, WorkerPool};

/// Registry of named worker pools.
///
/// Task classes get isolated pools so saturation in one (say, slow `io`
/// handlers) cannot starve another (`high_priority` heartbeats).
#[derive(Default)]
pub struct PoolRegistry {
    pools: DashMap<String, Arc<WorkerPool>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
        }
    }

    /// Create and register a pool under `name`. Replacing an existing pool is
    /// refused; close it first.
    pub fn register(&self, name: &str, config: PoolConfig) -> Result<Arc<WorkerPool>> {
        if self.pools.contains_key(name) {
            return Err(MiddlewareError::Conflict(format!(
                "pool {name} already registered"
            )));
        }
        let pool = Arc::new(WorkerPool::new(name, config));
        self.pools.insert(name.to_string(), Arc::clone(&pool));
        Ok(pool)
    }

    /// Fetch a pool by name.
    pub fn get(&self, name: &str) -> Option<Arc<WorkerPool>> {
        self.pools.get(name).map(|p| Arc::clone(&p))
    }

    /// Submit a task to the named pool.
    pub async fn submit_to<F>(&self, name: &str, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.get(name) {
            Some(pool) => pool.submit(task).await,
            None => Err(MiddlewareError::NotFound(format!("pool {name}"))),
        }
    }

    /// Stats for every registered pool.
    pub fn stats_all(&self) -> HashMap<String, PoolStats> {
        self.pools
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect()
    }

    /// Close and deregister one pool.
    pub async fn close(&self, name: &str, drain_timeout: Duration) -> Result<()> {
        match self.pools.remove(name) {
            Some((_, pool)) => {
                pool.close(drain_timeout).await;
                Ok(())
            }
            None => Err(MiddlewareError::NotFound(format!("pool {name}"))),
        }
    }

    /// Close every pool, draining each with the same timeout.
    pub async fn close_all(&self, drain_timeout: Duration) {
        let names: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        info!(pools = names.len(), "closing all worker pools");
        for name in names {
            if let Err(e) = self.close(&name, drain_timeout).await {
                warn!(pool = %name, error = %e, "pool close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn config() -> PoolConfig {
        PoolConfig {
            capacity: 2,
            hard_min: 1,
            hard_max: 4,
            queue_size: 64,
            blocking_submit: true,
            monitor_interval: None,
        }
    }

    #[tokio::test]
    async fn test_register_submit_and_stats() {
        let registry = PoolRegistry::new();
        registry.register("a", config()).expect("register a");
        registry.register("b", config()).expect("register b");
        assert!(registry.register("a", config()).is_err());

        let counter = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&counter);
        registry
            .submit_to("a", async move {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .expect("submit");

        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let stats = registry.stats_all();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["a"].submitted, 1);
        assert_eq!(stats["b"].submitted, 0);
    }

    #[tokio::test]
    async fn test_submit_to_unknown_pool() {
        let registry = PoolRegistry::new();
        let err = registry.submit_to("nope", async {}).await.expect_err("miss");
        assert!(matches!(err, MiddlewareError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_close_all_rejects_later_submissions() {
        let registry = PoolRegistry::new();
        let pool = registry.register("a", config()).expect("register");
        registry.close_all(Duration::from_secs(1)).await;

        assert!(registry.get("a").is_none());
        let err = pool.submit(async {}).await.expect_err("closed");
        assert!(matches!(err, MiddlewareError::PoolClosed(_)));
    }
}
