//! Error types for the ISR engine

use std::time::Duration;
use thiserror::Error;

/// Failure reported by a [`RenderClient`](crate::render::RenderClient).
#[derive(Debug, Error)]
pub enum RenderError {
    /// Upstream answered with a non-success status
    #[error("upstream responded with status {status}")]
    Upstream { status: u16 },

    /// Upstream could not be reached or the body could not be read
    #[error("render request failed: {0}")]
    Request(String),

    #[error("render timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The render task panicked or was cancelled
    #[error("render task crashed: {0}")]
    Crashed(String),

    /// Template or data error reported by the renderer itself
    #[error("render failed: {0}")]
    Failed(String),
}

/// Failure reported by a [`CacheStore`](crate::storage::CacheStore).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cache i/o error for {route}: {source}")]
    Io {
        route: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cache entry (de)serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote backend failure (connection, protocol)
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by the engine, the queue and the HTTP layer.
#[derive(Debug, Error)]
pub enum IsrError {
    #[error("rendering {route} failed: {source}")]
    Render {
        route: String,
        #[source]
        source: RenderError,
    },

    #[error("writing {route} to the cache failed: {source}")]
    CacheWrite {
        route: String,
        #[source]
        source: StorageError,
    },

    #[error("reading {route} from the cache failed: {source}")]
    CacheRead {
        route: String,
        #[source]
        source: StorageError,
    },

    /// Malformed webhook or API input; never enqueued
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing or invalid shared secret")]
    Unauthorized,
}

impl IsrError {
    /// HTTP status the error maps to at the boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            IsrError::InvalidPayload(_) => 400,
            IsrError::Unauthorized => 401,
            IsrError::Render { .. } => 502,
            IsrError::CacheWrite { .. } | IsrError::CacheRead { .. } => 500,
        }
    }
}

pub type Result<T, E = IsrError> = std::result::Result<T, E>;
