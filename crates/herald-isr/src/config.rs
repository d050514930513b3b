//! ISR configuration types

use crate::route::{normalize_route, route_has_prefix};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// ISR engine configuration
#[derive(Debug, Clone)]
pub struct IsrConfig {
    /// TTL applied when no override matches
    pub default_ttl: Duration,

    /// Per-route TTL overrides
    pub ttl_rules: Vec<TtlRule>,

    /// Maximum number of renders executing at once
    pub max_workers: usize,

    /// Maximum number of queued (not yet started) jobs
    pub max_queue_len: usize,

    /// Upper bound on a single render; `None` waits forever
    pub render_timeout: Option<Duration>,

    /// Primary storage backend
    pub storage: StorageBackend,

    /// Optional fallback storage backend
    pub fallback: Option<Box<StorageBackend>>,
}

impl Default for IsrConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(default_ttl()),
            ttl_rules: Vec::new(),
            max_workers: default_max_workers(),
            max_queue_len: default_max_queue_len(),
            render_timeout: Some(Duration::from_secs(default_render_timeout())),
            storage: StorageBackend::Memory,
            fallback: None,
        }
    }
}

impl IsrConfig {
    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy::new(self.default_ttl, self.ttl_rules.clone())
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-memory storage (fast, non-persistent)
    Memory,

    /// Filesystem storage (persistent, single-instance)
    Filesystem(FilesystemConfig),

    /// Dragonfly/Redis storage (fast, distributed)
    Dragonfly(DragonflyConfig),
}

/// Filesystem storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemConfig {
    /// Cache directory path
    pub path: PathBuf,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(default_cache_dir()),
        }
    }
}

/// Dragonfly (Redis-compatible) storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DragonflyConfig {
    /// Redis/Dragonfly connection URL
    pub url: String,

    /// Key prefix for ISR cache entries
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

fn default_key_prefix() -> String {
    "herald:isr:".to_string()
}

impl Default for DragonflyConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// TTL override for a route and everything below it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlRule {
    pub prefix: String,

    /// TTL in seconds
    pub ttl: u64,
}

/// Resolves the TTL for a route: longest matching prefix wins.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    default_ttl: Duration,
    rules: Vec<TtlRule>,
}

impl TtlPolicy {
    pub fn new(default_ttl: Duration, rules: Vec<TtlRule>) -> Self {
        let mut rules: Vec<TtlRule> = rules
            .into_iter()
            .map(|rule| TtlRule {
                prefix: normalize_route(&rule.prefix),
                ttl: rule.ttl,
            })
            .collect();
        rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Self { default_ttl, rules }
    }

    /// TTL in seconds for a normalized route
    pub fn ttl_for(&self, route: &str) -> u64 {
        self.rules
            .iter()
            .find(|rule| route_has_prefix(route, &rule.prefix))
            .map(|rule| rule.ttl)
            .unwrap_or(self.default_ttl.as_secs())
    }
}

/// `[isr]` section of herald.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsrTomlConfig {
    /// Persistence location for the filesystem backend
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// Default TTL in seconds
    #[serde(default = "default_ttl")]
    pub default_ttl: u64,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_max_queue_len")]
    pub max_queue_len: usize,

    /// Render timeout in seconds; 0 disables the timeout
    #[serde(default = "default_render_timeout")]
    pub render_timeout: u64,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageTomlConfig,

    /// Per-route TTL overrides
    #[serde(default)]
    pub ttl: Vec<TtlRule>,
}

impl Default for IsrTomlConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            default_ttl: default_ttl(),
            max_workers: default_max_workers(),
            max_queue_len: default_max_queue_len(),
            render_timeout: default_render_timeout(),
            storage: StorageTomlConfig::default(),
            ttl: Vec::new(),
        }
    }
}

/// Storage configuration in TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageTomlConfig {
    /// Primary storage backend: "memory", "filesystem", or "dragonfly"
    #[serde(default = "default_primary")]
    pub primary: String,

    /// Optional fallback storage backend
    #[serde(default)]
    pub fallback: Option<String>,

    /// Dragonfly-specific config
    #[serde(default)]
    pub dragonfly: Option<DragonflyConfig>,
}

impl Default for StorageTomlConfig {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            fallback: None,
            dragonfly: None,
        }
    }
}

fn default_cache_dir() -> String {
    ".herald/cache".to_string()
}

fn default_ttl() -> u64 {
    60
}

fn default_max_workers() -> usize {
    2
}

fn default_max_queue_len() -> usize {
    1024
}

fn default_render_timeout() -> u64 {
    30
}

fn default_primary() -> String {
    "filesystem".to_string()
}

impl IsrTomlConfig {
    /// Convert TOML config to runtime config
    pub fn to_runtime_config(&self) -> anyhow::Result<IsrConfig> {
        if self.max_workers == 0 {
            anyhow::bail!("isr.max_workers must be at least 1");
        }
        if self.max_queue_len == 0 {
            anyhow::bail!("isr.max_queue_len must be at least 1");
        }

        let storage = self.parse_storage_backend(&self.storage.primary)?;

        let fallback = if let Some(ref fallback_type) = self.storage.fallback {
            Some(Box::new(self.parse_storage_backend(fallback_type)?))
        } else {
            None
        };

        let render_timeout = match self.render_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(IsrConfig {
            default_ttl: Duration::from_secs(self.default_ttl),
            ttl_rules: self.ttl.clone(),
            max_workers: self.max_workers,
            max_queue_len: self.max_queue_len,
            render_timeout,
            storage,
            fallback,
        })
    }

    fn parse_storage_backend(&self, backend_type: &str) -> anyhow::Result<StorageBackend> {
        match backend_type {
            "memory" => Ok(StorageBackend::Memory),
            "filesystem" => Ok(StorageBackend::Filesystem(FilesystemConfig {
                path: PathBuf::from(&self.cache_dir),
            })),
            "dragonfly" => {
                let config = self.storage.dragonfly.clone().ok_or_else(|| {
                    anyhow::anyhow!(
                        "Dragonfly storage requires [isr.storage.dragonfly] configuration"
                    )
                })?;
                Ok(StorageBackend::Dragonfly(config))
            }
            _ => Err(anyhow::anyhow!("Unknown storage backend: {}", backend_type)),
        }
    }
}
