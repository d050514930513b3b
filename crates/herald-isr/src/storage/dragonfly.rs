//! Dragonfly (Redis-compatible) storage backend for ISR cache

use crate::cache::CacheEntry;
use crate::config::DragonflyConfig;
use crate::error::StorageError;
use crate::storage::CacheStore;
use anyhow::Context;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

/// Dragonfly storage backend
///
/// Stores entries as JSON strings under a key prefix. Keys are written
/// without a Redis expiry: stale entries have to stay servable until a
/// revalidation replaces them.
#[derive(Clone)]
pub struct DragonflyStore {
    manager: ConnectionManager,
    config: DragonflyConfig,
}

impl DragonflyStore {
    /// Create a new Dragonfly storage backend
    pub async fn new(config: DragonflyConfig) -> anyhow::Result<Self> {
        let client = Client::open(config.url.as_str())
            .context("Failed to create Redis/Dragonfly client")?;

        let manager = ConnectionManager::new(client)
            .await
            .context("Failed to create connection manager")?;

        Ok(Self { manager, config })
    }

    /// Get the full key with prefix
    fn full_key(&self, route: &str) -> String {
        format!("{}{}", self.config.key_prefix, route)
    }

    /// Test connection to Dragonfly/Redis
    pub async fn ping(&self) -> Result<bool, StorageError> {
        let mut conn = self.manager.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend_error)?;

        Ok(pong == "PONG")
    }
}

fn backend_error(e: redis::RedisError) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// SCAN pattern matching every key under `prefix`, with glob characters in
/// the prefix taken literally
fn scan_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

fn route_from_key<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    key.strip_prefix(prefix)
}

#[async_trait]
impl CacheStore for DragonflyStore {
    async fn get(&self, route: &str) -> Result<Option<CacheEntry>, StorageError> {
        let mut conn = self.manager.clone();

        let json: Option<String> = conn
            .get(self.full_key(route))
            .await
            .map_err(backend_error)?;

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        let mut conn = self.manager.clone();
        let json = serde_json::to_string(entry)?;

        // SET replaces the value in one step, so readers never see a partial entry
        conn.set::<_, _, ()>(self.full_key(&entry.route), json)
            .await
            .map_err(backend_error)?;

        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut conn = self.manager.clone();
        let pattern = scan_pattern(&self.config.key_prefix);

        let mut iter: redis::AsyncIter<'_, String> = conn
            .scan_match(&pattern)
            .await
            .map_err(backend_error)?;

        let mut keys = Vec::new();
        while let Some(full_key) = iter.next_item().await {
            if let Some(route) = route_from_key(&self.config.key_prefix, &full_key) {
                keys.push(route.to_string());
            }
        }

        Ok(keys)
    }

    fn name(&self) -> &'static str {
        "dragonfly"
    }
}
