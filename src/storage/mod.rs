//! Backing-store adapter.
//!
//! The cache manager reads through this interface and nothing else, so the
//! concrete store is swappable: the in-memory implementation below serves
//! tests and DSN-less deployments, a database-backed implementation satisfies
//! the same contract in production.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::types::Result;

/// Narrow storage contract. Errors surface to the caller untouched.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch a value. `Ok(None)` is a confirmed absence, not an error.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or replace a value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove a value. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`, in unspecified order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory store backed by a concurrent map.
#[derive(Default)]
pub struct MemoryStorage {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        debug!(key, bytes = value.len(), "storage put");
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get("user:game1:1").await.expect("get"), None);

        storage
            .put("user:game1:1", b"alice".to_vec())
            .await
            .expect("put");
        assert_eq!(
            storage.get("user:game1:1").await.expect("get"),
            Some(b"alice".to_vec())
        );

        storage.delete("user:game1:1").await.expect("delete");
        assert_eq!(storage.get("user:game1:1").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_list_filters_by_prefix() {
        let storage = MemoryStorage::new();
        for key in ["user:game1:1", "user:game1:2", "user:game2:1", "item:game1:1"] {
            storage.put(key, b"v".to_vec()).await.expect("put");
        }

        let mut keys = storage.list("user:game1:").await.expect("list");
        keys.sort();
        assert_eq!(keys, vec!["user:game1:1", "user:game1:2"]);
    }
}
