//! Filesystem storage backend for ISR cache

use crate::cache::CacheEntry;
use crate::config::FilesystemConfig;
use crate::error::StorageError;
use crate::storage::CacheStore;
use anyhow::Context;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;

const ENTRY_EXTENSION: &str = "json";

/// Filesystem storage backend
///
/// Stores one JSON file per route, named after the percent-encoded route.
/// Writes land in a temporary file that is renamed over the old entry, so a
/// failed write leaves the previous entry untouched.
#[derive(Clone)]
pub struct FilesystemStore {
    config: FilesystemConfig,
}

impl FilesystemStore {
    /// Create a new filesystem storage backend
    pub async fn new(config: FilesystemConfig) -> anyhow::Result<Self> {
        fs::create_dir_all(&config.path)
            .await
            .with_context(|| format!("Failed to create cache directory {:?}", config.path))?;

        Ok(Self { config })
    }

    /// Get the file path for a route
    fn route_to_path(&self, route: &str) -> PathBuf {
        let file_name = format!("{}.{}", urlencoding::encode(route), ENTRY_EXTENSION);
        self.config.path.join(file_name)
    }

    fn io_error(route: &str, source: std::io::Error) -> StorageError {
        StorageError::Io {
            route: route.to_string(),
            source,
        }
    }
}

#[async_trait]
impl CacheStore for FilesystemStore {
    async fn get(&self, route: &str) -> Result<Option<CacheEntry>, StorageError> {
        let path = self.route_to_path(route);

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::io_error(route, e)),
        };

        let entry: CacheEntry = serde_json::from_str(&content)?;
        Ok(Some(entry))
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        let path = self.route_to_path(&entry.route);
        let json = serde_json::to_vec(entry)?;

        let tmp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));

        if let Err(e) = fs::write(&tmp_path, &json).await {
            fs::remove_file(&tmp_path).await.ok();
            return Err(Self::io_error(&entry.route, e));
        }

        if let Err(e) = fs::rename(&tmp_path, &path).await {
            fs::remove_file(&tmp_path).await.ok();
            return Err(Self::io_error(&entry.route, e));
        }

        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.config.path)
            .await
            .map_err(|e| Self::io_error("*", e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_error("*", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }

            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                if let Ok(route) = urlencoding::decode(stem) {
                    keys.push(route.into_owned());
                }
            }
        }

        Ok(keys)
    }

    fn name(&self) -> &'static str {
        "filesystem"
    }
}
