//! Tiered caching: L2 client wrapper, circuit breaker, and the composing
//! cache manager. The L1 data structure itself lives in the
//! `middleware-cache-core` crate.
//!
//! Key space is flat strings, namespaced by convention: `user:<game>:<id>`,
//! `item:<game>:<id>`, `order:<game>:<id>`.

mod breaker;
mod l2;
mod manager;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use l2::{InMemoryRemoteCache, L2Cache, L2Config, L2Stats, RemoteCache};
pub use manager::{
    spawn_l1_sweeper, CacheManager, CacheManagerConfig, ProtectionStats,
};

/// Cache key for a player record.
pub fn user_key(game_id: &str, user_id: &str) -> String {
    format!("user:{game_id}:{user_id}")
}

/// Cache key for an item record.
pub fn item_key(game_id: &str, item_id: &str) -> String {
    format!("item:{game_id}:{item_id}")
}

/// Key prefix for all items of a game, for listings.
pub fn item_prefix(game_id: &str) -> String {
    format!("item:{game_id}:")
}

/// Cache key for an order record.
pub fn order_key(game_id: &str, order_id: &str) -> String {
    format!("order:{game_id}:{order_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_namespacing() {
        assert_eq!(user_key("game1", "42"), "user:game1:42");
        assert_eq!(item_key("game1", "sword"), "item:game1:sword");
        assert_eq!(order_key("game2", "o-9"), "order:game2:o-9");
    }
}
