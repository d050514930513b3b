//! Primary + fallback storage

use crate::cache::CacheEntry;
use crate::error::StorageError;
use crate::storage::CacheStore;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

/// Reads fall through to the fallback and promote hits into the primary.
/// Writes must succeed on the primary; the fallback is best effort.
pub struct TieredStore {
    primary: Arc<dyn CacheStore>,
    fallback: Arc<dyn CacheStore>,
}

impl TieredStore {
    pub fn new(primary: Arc<dyn CacheStore>, fallback: Arc<dyn CacheStore>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl CacheStore for TieredStore {
    async fn get(&self, route: &str) -> Result<Option<CacheEntry>, StorageError> {
        let primary_error = match self.primary.get(route).await {
            Ok(Some(entry)) => return Ok(Some(entry)),
            Ok(None) => None,
            Err(e) => {
                warn!(route, backend = self.primary.name(), error = %e, "primary cache read failed, trying fallback");
                Some(e)
            }
        };

        match self.fallback.get(route).await {
            Ok(Some(entry)) => {
                // Promote to primary storage, keeping the original timestamp
                if let Err(e) = self.primary.put(&entry).await {
                    warn!(route, error = %e, "failed to promote fallback entry");
                }
                Ok(Some(entry))
            }
            Ok(None) => match primary_error {
                Some(e) => Err(e),
                None => Ok(None),
            },
            Err(e) => Err(primary_error.unwrap_or(e)),
        }
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        self.primary.put(entry).await?;

        if let Err(e) = self.fallback.put(entry).await {
            warn!(route = %entry.route, backend = self.fallback.name(), error = %e, "fallback cache write failed");
        }

        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys: BTreeSet<String> = self.primary.keys().await?.into_iter().collect();
        if let Ok(fallback_keys) = self.fallback.keys().await {
            keys.extend(fallback_keys);
        }
        Ok(keys.into_iter().collect())
    }

    fn name(&self) -> &'static str {
        "tiered"
    }
}
