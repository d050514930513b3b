//! In-memory storage backend for ISR cache

use crate::cache::CacheEntry;
use crate::error::StorageError;
use crate::storage::CacheStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory storage backend
///
/// Stores entries in a HashMap keyed by route.
/// Fast but non-persistent - cache is lost on restart.
#[derive(Clone, Default)]
pub struct MemoryStore {
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl MemoryStore {
    /// Create a new memory storage backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Get cache size (number of entries)
    pub async fn size(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, route: &str) -> Result<Option<CacheEntry>, StorageError> {
        let cache = self.cache.read().await;
        Ok(cache.get(route).cloned())
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        let mut cache = self.cache.write().await;
        cache.insert(entry.route.clone(), entry.clone());
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let cache = self.cache.read().await;
        Ok(cache.keys().cloned().collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
