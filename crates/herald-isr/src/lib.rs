//! # Herald ISR - Incremental Static Regeneration
//!
//! Cache-first page serving for the Herald community portal.
//!
//! ## Features
//!
//! - **Stale-While-Revalidate**: stale pages are served at once and refreshed in the background
//! - **Revalidation Queue**: bounded workers, one job per route, high-priority webhook jobs
//! - **Webhook Invalidation**: domain events fan out to the routes they affect
//! - **Multiple Storage Backends**: Memory, Filesystem, Dragonfly (Redis), with fallback
//!
//! ## Example
//!
//! ```rust,no_run
//! use herald_isr::{HttpRenderClient, IsrConfig, IsrEngine};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let renderer = Arc::new(HttpRenderClient::new("http://127.0.0.1:4000")?);
//!     let engine = IsrEngine::new(IsrConfig::default(), renderer).await?;
//!
//!     let served = engine.serve("/news").await?;
//!     println!("{} {}", served.status.as_str(), served.entry.artifact.html.len());
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod invalidation;
pub mod queue;
pub mod render;
pub mod route;
pub mod route_lock;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use cache::{Artifact, CacheEntry, CacheStats, CacheStatus, Freshness, PageMeta};
pub use config::{IsrConfig, IsrTomlConfig, StorageBackend, TtlPolicy, TtlRule};
pub use engine::{IsrEngine, Served};
pub use error::{IsrError, RenderError, Result, StorageError};
pub use http::{router, IsrHttpConfig, IsrState};
pub use invalidation::{InvalidationEvent, InvalidationHandler, RouteTable};
pub use queue::{AddOutcome, Priority, QueueEvent, QueueStatus, RevalidationQueue};
pub use render::{HttpRenderClient, RenderClient, Revalidator};
pub use route::normalize_route;
pub use storage::{build_store, CacheStore};
