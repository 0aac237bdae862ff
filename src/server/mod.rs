//! Server composition: shared state, the TCP accept loop, and the HTTP
//! surface.

mod http;
mod tcp;

pub use http::run_http;
pub use tcp::run_tcp;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::auth::JwtValidator;
use crate::cache::{
    spawn_l1_sweeper, CacheManager, CacheManagerConfig, InMemoryRemoteCache, L2Cache, L2Config,
};
use crate::config::Args;
use crate::dispatch::{Dispatcher, RouterBuilder};
use crate::handlers::{register_routes, HandlerContext};
use crate::metrics::Metrics;
use crate::pool::{PoolConfig, PoolRegistry, POOL_HIGH_PRIORITY, POOL_IO, POOL_NORMAL};
use crate::queue::{AsyncTaskManager, TaskExecutor, TaskKind, TaskResult};
use crate::session::{SessionConfig, SessionDeps, SessionRegistry};
use crate::storage::{MemoryStorage, Storage};
use crate::types::{MiddlewareError, Result};
use middleware_cache_core::ShardedCacheConfig;

/// Shared application state.
pub struct AppState {
    pub args: Args,
    pub metrics: Arc<Metrics>,
    pub pools: Arc<PoolRegistry>,
    pub cache: Arc<CacheManager>,
    pub tasks: Arc<AsyncTaskManager>,
    pub jwt: Arc<JwtValidator>,
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<SessionRegistry>,
    pub session_deps: Arc<SessionDeps>,
    started_at: Instant,
}

/// Executes queued business and cleanup work against the cache tier.
struct CacheTaskExecutor {
    cache: Arc<CacheManager>,
}

#[async_trait]
impl TaskExecutor for CacheTaskExecutor {
    async fn execute(&self, kind: &TaskKind) -> TaskResult {
        match kind {
            TaskKind::Business { op, params } => {
                // Business follow-ups are acknowledgements of completed work;
                // the authoritative write already happened on the request
                // path.
                info!(op = %op, params = %params, "business follow-up processed");
                Ok(Value::Bool(true))
            }
            TaskKind::Cleanup { resource, id } => {
                let key = format!("{resource}:{id}");
                self.cache.invalidate(&key).await;
                Ok(Value::Bool(true))
            }
            TaskKind::Log { .. } => Ok(Value::Null),
        }
    }
}

impl AppState {
    /// Build every component from configuration. Failures here are fatal
    /// startup errors (exit code 2).
    pub fn build(args: Args) -> Result<Arc<Self>> {
        let secret = args.jwt_secret().ok_or_else(|| {
            MiddlewareError::Internal("jwt secret missing after validation".to_string())
        })?;
        let jwt = Arc::new(JwtValidator::new(&secret, args.jwt_expiry_seconds));
        let metrics = Arc::new(Metrics::new());

        // Worker pools, one per task class.
        let pools = Arc::new(PoolRegistry::new());
        let base_pool = PoolConfig {
            capacity: args.pool_capacity,
            hard_min: args.pool_hard_min,
            hard_max: args.pool_hard_max,
            queue_size: args.pool_queue_size,
            blocking_submit: true,
            monitor_interval: Some(Duration::from_secs(5)),
        };
        pools.register(POOL_NORMAL, base_pool.clone())?;
        pools.register(
            POOL_HIGH_PRIORITY,
            PoolConfig {
                capacity: (args.pool_capacity / 4).max(args.pool_hard_min),
                ..base_pool.clone()
            },
        )?;
        pools.register(
            POOL_IO,
            PoolConfig {
                capacity: (args.pool_capacity / 2).max(args.pool_hard_min),
                ..base_pool
            },
        )?;

        // Storage and the cache tiers. The in-memory store backs DSN-less
        // deployments; a database-backed adapter plugs in behind the same
        // trait.
        if let Some(dsn) = &args.database_dsn {
            info!(dsn = %dsn, "database dsn configured; storage adapter must be provided by the embedding binary");
        }
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let l2 = L2Cache::new(
            Arc::new(InMemoryRemoteCache::new()),
            L2Config {
                call_timeout: args.l2_timeout(),
                breaker: crate::cache::BreakerConfig {
                    failure_threshold: args.l2_failure_threshold,
                    failure_window: Duration::from_secs(10),
                    cooldown: Duration::from_secs(args.l2_cooldown_secs),
                },
            },
        );
        let cache = Arc::new(CacheManager::new(
            CacheManagerConfig {
                l1: ShardedCacheConfig {
                    shard_count: args.l1_shards,
                    max_entries_per_shard: args.l1_max_per_shard,
                },
                positive_ttl: args.cache_ttl(),
                negative_ttl: args.negative_ttl(),
            },
            l2,
            storage,
        ));

        // Async follow-up work.
        let tasks = Arc::new(AsyncTaskManager::new(
            args.async_consumers,
            Arc::new(CacheTaskExecutor {
                cache: Arc::clone(&cache),
            }),
        ));

        // Route table, one handler set per configured game.
        let handler_ctx = Arc::new(HandlerContext {
            cache: Arc::clone(&cache),
            tasks: Arc::clone(&tasks),
            jwt: Arc::clone(&jwt),
            games: args.game_list(),
        });
        let dispatcher = Arc::new(
            register_routes(RouterBuilder::new(), &handler_ctx)
                .build(Arc::clone(&pools), Arc::clone(&metrics)),
        );

        let sessions = Arc::new(SessionRegistry::new());
        let session_deps = Arc::new(SessionDeps {
            config: SessionConfig {
                max_frame_body: args.max_frame_body,
                read_timeout: args.read_timeout(),
                heartbeat_interval: args.heartbeat_interval(),
                max_missed: args.max_missed_heartbeats,
                write_queue_size: args.write_queue_size,
                drain_timeout: Duration::from_secs(5),
            },
            dispatcher: Arc::clone(&dispatcher),
            jwt: Arc::clone(&jwt),
            registry: Arc::clone(&sessions),
            metrics: Arc::clone(&metrics),
        });

        Ok(Arc::new(Self {
            args,
            metrics,
            pools,
            cache,
            tasks,
            jwt,
            dispatcher,
            sessions,
            session_deps,
            started_at: Instant::now(),
        }))
    }

    /// Start background services: async consumers, the L1 sweeper, and the
    /// startup warmup.
    pub async fn start_background(&self) {
        self.tasks.start();
        spawn_l1_sweeper(Arc::clone(&self.cache), Duration::from_secs(60));

        let warmup = self.args.warmup_key_list();
        if !warmup.is_empty() {
            self.cache.warmup(&warmup).await;
        }
    }

    /// Graceful teardown in reverse construction order: drain the async
    /// queue, then close the worker pools.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.tasks.stop(Duration::from_secs(10)).await;
        self.pools.close_all(Duration::from_secs(10)).await;
        if !self.sessions.is_empty() {
            warn!(open = self.sessions.len(), "sessions still open at shutdown");
        }
        info!("shutdown complete");
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}
