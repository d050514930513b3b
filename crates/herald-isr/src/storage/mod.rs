//! Storage backends for ISR cache

use crate::cache::{Artifact, CacheEntry};
use crate::config::StorageBackend;
use crate::error::StorageError;
use async_trait::async_trait;
use std::sync::Arc;

pub mod filesystem;
pub mod memory;
pub mod tiered;

#[cfg(feature = "dragonfly")]
pub mod dragonfly;

/// Durable route → entry mapping.
///
/// Writes are last-writer-wins and must never leave a partially written
/// entry observable: on failure the previous entry stays readable.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get the entry for a route, if any
    async fn get(&self, route: &str) -> Result<Option<CacheEntry>, StorageError>;

    /// Store an entry exactly as given, replacing any previous entry for its route
    async fn put(&self, entry: &CacheEntry) -> Result<(), StorageError>;

    /// All cached routes
    async fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Get storage backend name
    fn name(&self) -> &'static str;

    /// Write a freshly rendered artifact, stamping `created_at` with the current time
    async fn set(
        &self,
        route: &str,
        artifact: Artifact,
        ttl_seconds: u64,
    ) -> Result<CacheEntry, StorageError> {
        let entry = CacheEntry::new(route, artifact, ttl_seconds);
        self.put(&entry).await?;
        Ok(entry)
    }
}

/// Create the configured store, wrapping it with its fallback when one is set
pub async fn build_store(
    primary: &StorageBackend,
    fallback: Option<&StorageBackend>,
) -> anyhow::Result<Arc<dyn CacheStore>> {
    let primary = create_storage(primary).await?;

    match fallback {
        Some(backend) => {
            let fallback = create_storage(backend).await?;
            Ok(Arc::new(tiered::TieredStore::new(primary, fallback)))
        }
        None => Ok(primary),
    }
}

async fn create_storage(backend: &StorageBackend) -> anyhow::Result<Arc<dyn CacheStore>> {
    match backend {
        StorageBackend::Memory => Ok(Arc::new(memory::MemoryStore::new())),
        StorageBackend::Filesystem(config) => {
            let store = filesystem::FilesystemStore::new(config.clone()).await?;
            Ok(Arc::new(store))
        }
        #[cfg(feature = "dragonfly")]
        StorageBackend::Dragonfly(config) => {
            let store = dragonfly::DragonflyStore::new(config.clone()).await?;
            if !store.ping().await? {
                anyhow::bail!("Dragonfly at {} did not answer PING", config.url);
            }
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "dragonfly"))]
        StorageBackend::Dragonfly(_) => {
            anyhow::bail!("Dragonfly storage requires the 'dragonfly' feature to be enabled")
        }
    }
}
