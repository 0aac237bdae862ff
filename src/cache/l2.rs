//! Shared L2 cache client wrapper.
//!
//! Every call runs under a per-call timeout and behind the circuit breaker.
//! While the breaker is open, calls fail fast with `BreakerOpen` so an L2
//! outage never stacks timeouts in front of the read path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::types::{MiddlewareError, Result};

use super::breaker::{BreakerConfig, BreakerState, CircuitBreaker};

/// Contract for the remote cache client.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Configuration for the [`L2Cache`] wrapper.
#[derive(Debug, Clone)]
pub struct L2Config {
    /// Per-call timeout.
    pub call_timeout: Duration,
    pub breaker: BreakerConfig,
}

impl Default for L2Config {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_millis(200),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Breaker snapshot for operational endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct L2Stats {
    pub breaker_state: BreakerState,
    pub breaker_trips: u64,
}

/// Timeout- and breaker-guarded L2 client.
pub struct L2Cache {
    client: Arc<dyn RemoteCache>,
    breaker: CircuitBreaker,
    call_timeout: Duration,
}

impl L2Cache {
    pub fn new(client: Arc<dyn RemoteCache>, config: L2Config) -> Self {
        Self {
            client,
            breaker: CircuitBreaker::new("l2", config.breaker),
            call_timeout: config.call_timeout,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.guarded(key, self.client.get(key)).await
    }

    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.guarded(key, self.client.set(key, value, ttl)).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.guarded(key, self.client.delete(key)).await
    }

    pub fn stats(&self) -> L2Stats {
        L2Stats {
            breaker_state: self.breaker.state(),
            breaker_trips: self.breaker.trips(),
        }
    }

    pub fn breaker_trips(&self) -> u64 {
        self.breaker.trips()
    }

    async fn guarded<T>(
        &self,
        key: &str,
        call: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        if !self.breaker.is_allowed() {
            return Err(MiddlewareError::BreakerOpen("l2".to_string()));
        }

        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(value)) => {
                self.breaker.record_success();
                Ok(value)
            }
            Ok(Err(e)) => {
                self.breaker.record_failure();
                warn!(key, error = %e, "l2 call failed");
                Err(MiddlewareError::L2Unavailable(e.to_string()))
            }
            Err(_) => {
                self.breaker.record_failure();
                debug!(key, timeout_ms = self.call_timeout.as_millis() as u64, "l2 call timed out");
                Err(MiddlewareError::Timeout(format!("l2 call for {key}")))
            }
        }
    }
}

/// In-process stand-in for the shared cache, used in tests and DSN-less
/// single-node deployments.
#[derive(Default)]
pub struct InMemoryRemoteCache {
    entries: DashMap<String, (Vec<u8>, Instant)>,
}

impl InMemoryRemoteCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

#[async_trait]
impl RemoteCache for InMemoryRemoteCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let expired = match self.entries.get(key) {
            Some(entry) if Instant::now() < entry.1 => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
