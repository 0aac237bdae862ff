//! Configuration for the data middleware gateway.
//!
//! CLI arguments and environment variable handling using clap. Every flag has
//! a `DATAMIDDLEWARE_*` environment override so container deployments can run
//! without a command line.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use uuid::Uuid;

/// Data middleware - multi-tenant game data gateway
#[derive(Parser, Debug, Clone)]
#[command(name = "datamiddleware")]
#[command(about = "TCP/HTTP gateway with tiered caching for game data services")]
pub struct Args {
    /// Unique node identifier for this gateway instance
    #[arg(long, env = "DATAMIDDLEWARE_NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Address for the binary TCP protocol listener
    #[arg(long, env = "DATAMIDDLEWARE_TCP_LISTEN", default_value = "0.0.0.0:9000")]
    pub tcp_listen: SocketAddr,

    /// Address for the HTTP/JSON API listener
    #[arg(long, env = "DATAMIDDLEWARE_HTTP_LISTEN", default_value = "0.0.0.0:8080")]
    pub http_listen: SocketAddr,

    /// Comma-separated list of registered game ids (tenants)
    #[arg(long, env = "DATAMIDDLEWARE_GAMES", default_value = "game1")]
    pub games: String,

    /// Maximum frame body size in bytes
    #[arg(long, env = "DATAMIDDLEWARE_MAX_FRAME_BODY", default_value = "65536")]
    pub max_frame_body: usize,

    /// Per-frame socket read timeout in milliseconds
    #[arg(long, env = "DATAMIDDLEWARE_READ_TIMEOUT_MS", default_value = "5000")]
    pub read_timeout_ms: u64,

    /// Idle interval before a heartbeat frame is sent, in seconds
    #[arg(long, env = "DATAMIDDLEWARE_HEARTBEAT_SECS", default_value = "30")]
    pub heartbeat_secs: u64,

    /// Missed heartbeats before a session is closed
    #[arg(long, env = "DATAMIDDLEWARE_MAX_MISSED_HEARTBEATS", default_value = "3")]
    pub max_missed_heartbeats: u32,

    /// Bound of each session's write queue
    #[arg(long, env = "DATAMIDDLEWARE_WRITE_QUEUE_SIZE", default_value = "256")]
    pub write_queue_size: usize,

    /// Initial capacity of the normal-priority worker pool
    #[arg(long, env = "DATAMIDDLEWARE_POOL_CAPACITY", default_value = "32")]
    pub pool_capacity: usize,

    /// Hard minimum worker-pool capacity the tuner may shrink to
    #[arg(long, env = "DATAMIDDLEWARE_POOL_HARD_MIN", default_value = "4")]
    pub pool_hard_min: usize,

    /// Hard maximum worker-pool capacity the tuner may grow to
    #[arg(long, env = "DATAMIDDLEWARE_POOL_HARD_MAX", default_value = "256")]
    pub pool_hard_max: usize,

    /// Maximum queued submissions per worker pool
    #[arg(long, env = "DATAMIDDLEWARE_POOL_QUEUE_SIZE", default_value = "1024")]
    pub pool_queue_size: usize,

    /// Number of async queue consumer workers
    #[arg(long, env = "DATAMIDDLEWARE_ASYNC_CONSUMERS", default_value = "4")]
    pub async_consumers: usize,

    /// Number of L1 cache shards (rounded up to a power of two)
    #[arg(long, env = "DATAMIDDLEWARE_L1_SHARDS", default_value = "16")]
    pub l1_shards: usize,

    /// Hard cap on entries per L1 shard
    #[arg(long, env = "DATAMIDDLEWARE_L1_MAX_PER_SHARD", default_value = "4096")]
    pub l1_max_per_shard: usize,

    /// TTL for positive cache entries, in seconds
    #[arg(long, env = "DATAMIDDLEWARE_CACHE_TTL_SECS", default_value = "300")]
    pub cache_ttl_secs: u64,

    /// TTL for negative (confirmed-absent) cache entries, in seconds
    #[arg(long, env = "DATAMIDDLEWARE_NEGATIVE_TTL_SECS", default_value = "30")]
    pub negative_ttl_secs: u64,

    /// Per-call timeout for the L2 cache, in milliseconds
    #[arg(long, env = "DATAMIDDLEWARE_L2_TIMEOUT_MS", default_value = "200")]
    pub l2_timeout_ms: u64,

    /// Consecutive L2 failures before the circuit breaker opens
    #[arg(long, env = "DATAMIDDLEWARE_L2_FAILURE_THRESHOLD", default_value = "5")]
    pub l2_failure_threshold: u32,

    /// Cool-down before an open L2 breaker allows a probe, in seconds
    #[arg(long, env = "DATAMIDDLEWARE_L2_COOLDOWN_SECS", default_value = "30")]
    pub l2_cooldown_secs: u64,

    /// Backing store DSN (the in-memory store is used when unset)
    #[arg(long, env = "DATAMIDDLEWARE_DATABASE_DSN")]
    pub database_dsn: Option<String>,

    /// JWT secret for token validation and issuance (required in production)
    #[arg(long, env = "DATAMIDDLEWARE_JWT_SECRET")]
    pub jwt_secret: Option<String>,

    /// JWT token expiry in seconds
    #[arg(long, env = "DATAMIDDLEWARE_JWT_EXPIRY_SECONDS", default_value = "3600")]
    pub jwt_expiry_seconds: u64,

    /// Comma-separated cache keys to warm through the manager at startup
    #[arg(long, env = "DATAMIDDLEWARE_WARMUP_KEYS")]
    pub warmup_keys: Option<String>,

    /// Enable development mode (permits a default JWT secret)
    #[arg(long, env = "DATAMIDDLEWARE_DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "DATAMIDDLEWARE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// The registered tenant game ids.
    pub fn game_list(&self) -> Vec<String> {
        self.games
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Cache keys to warm at startup.
    pub fn warmup_key_list(&self) -> Vec<String> {
        self.warmup_keys
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Effective JWT secret (a fixed insecure value in dev mode).
    pub fn jwt_secret(&self) -> Option<String> {
        if self.dev_mode {
            Some(
                self.jwt_secret
                    .clone()
                    .unwrap_or_else(|| "dev-only-insecure-secret".to_string()),
            )
        } else {
            self.jwt_secret.clone()
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl_secs)
    }

    pub fn l2_timeout(&self) -> Duration {
        Duration::from_millis(self.l2_timeout_ms)
    }

    /// Validate configuration. Failures here exit with code 1.
    pub fn validate(&self) -> Result<(), String> {
        if self.game_list().is_empty() {
            return Err("at least one game id must be registered".to_string());
        }
        if !self.dev_mode && self.jwt_secret.is_none() {
            return Err("DATAMIDDLEWARE_JWT_SECRET is required in production mode".to_string());
        }
        if self.pool_hard_min > self.pool_hard_max {
            return Err("pool hard_min must not exceed hard_max".to_string());
        }
        if self.pool_capacity < self.pool_hard_min || self.pool_capacity > self.pool_hard_max {
            return Err("pool capacity must lie within [hard_min, hard_max]".to_string());
        }
        if self.negative_ttl_secs >= self.cache_ttl_secs {
            return Err("negative TTL must be shorter than the positive TTL".to_string());
        }
        if self.max_frame_body == 0 {
            return Err("max frame body must be non-zero".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from(["datamiddleware", "--dev-mode"])
    }

    #[test]
    fn test_defaults_are_valid_in_dev_mode() {
        let args = base_args();
        assert!(args.validate().is_ok());
        assert_eq!(args.game_list(), vec!["game1".to_string()]);
        assert_eq!(args.max_frame_body, 65536);
    }

    #[test]
    fn test_production_requires_jwt_secret() {
        let args = Args::parse_from(["datamiddleware"]);
        assert!(args.validate().is_err());

        let args = Args::parse_from(["datamiddleware", "--jwt-secret", "s3cret"]);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_game_list_parses_and_trims() {
        let args = Args::parse_from([
            "datamiddleware",
            "--dev-mode",
            "true",
            "--games",
            "game1, game2 ,,game3",
        ]);
        assert_eq!(args.game_list(), vec!["game1", "game2", "game3"]);
    }

    #[test]
    fn test_negative_ttl_must_be_shorter() {
        let mut args = base_args();
        args.negative_ttl_secs = args.cache_ttl_secs;
        assert!(args.validate().is_err());
    }
}
