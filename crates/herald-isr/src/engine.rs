//! ISR engine core - cache-first serving with stale-while-revalidate

use crate::cache::{CacheEntry, CacheStats, CacheStatus, Freshness};
use crate::config::IsrConfig;
use crate::error::{IsrError, Result};
use crate::queue::{AddOutcome, Priority, QueueEvent, RevalidationQueue};
use crate::render::{RenderClient, Revalidator};
use crate::route::normalize_route;
use crate::storage::{build_store, CacheStore};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

/// A page answered by the engine
#[derive(Debug, Clone)]
pub struct Served {
    pub entry: CacheEntry,
    pub status: CacheStatus,
}

/// ISR engine: serves routes from the cache and keeps them fresh
#[derive(Clone)]
pub struct IsrEngine {
    store: Arc<dyn CacheStore>,
    revalidator: Arc<Revalidator>,
    queue: RevalidationQueue,
    stats: Arc<RwLock<CacheStats>>,
}

impl IsrEngine {
    /// Create a new ISR engine, building the configured storage backends
    pub async fn new(config: IsrConfig, renderer: Arc<dyn RenderClient>) -> anyhow::Result<Self> {
        let store = build_store(&config.storage, config.fallback.as_deref()).await?;
        Ok(Self::with_store(config, store, renderer))
    }

    /// Create an engine over an existing store
    pub fn with_store(
        config: IsrConfig,
        store: Arc<dyn CacheStore>,
        renderer: Arc<dyn RenderClient>,
    ) -> Self {
        let revalidator = Arc::new(Revalidator::new(
            renderer,
            Arc::clone(&store),
            config.ttl_policy(),
            config.render_timeout,
        ));
        let queue = RevalidationQueue::new(
            Arc::clone(&revalidator),
            config.max_workers,
            config.max_queue_len,
        );

        Self {
            store,
            revalidator,
            queue,
            stats: Arc::new(RwLock::new(CacheStats::default())),
        }
    }

    /// Serve a route.
    ///
    /// - fresh entry: returned as is
    /// - stale entry: returned immediately, refreshed in the background
    /// - no entry: rendered now, stored, then returned
    pub async fn serve(&self, path: &str) -> Result<Served> {
        let route = normalize_route(path);

        match self.store.get(&route).await {
            Ok(Some(entry)) => match entry.freshness_at(Utc::now()) {
                Freshness::Fresh => {
                    debug!(route = %route, "isr cache hit");
                    self.stats.write().await.hits += 1;
                    Ok(Served {
                        entry,
                        status: CacheStatus::Hit,
                    })
                }
                Freshness::Stale => {
                    debug!(route = %route, "isr cache stale, revalidating in background");
                    self.stats.write().await.stale_hits += 1;
                    self.queue.add(&route, Priority::Normal);
                    Ok(Served {
                        entry,
                        status: CacheStatus::Stale,
                    })
                }
            },
            Ok(None) => {
                debug!(route = %route, "isr cache miss");
                self.render_cold(&route).await
            }
            Err(e) => {
                warn!(route = %route, backend = self.store.name(), error = %e, "cache read failed, rendering");
                self.render_cold(&route).await
            }
        }
    }

    /// Synchronous render for a route with no usable entry.
    ///
    /// Concurrent misses for one route share a single render: later callers
    /// wait for the route lock and then serve what the first one stored.
    async fn render_cold(&self, route: &str) -> Result<Served> {
        self.stats.write().await.misses += 1;

        let _guard = self.revalidator.lock_route(route).await;
        if let Ok(Some(entry)) = self.store.get(route).await {
            if entry.freshness_at(Utc::now()) == Freshness::Fresh {
                debug!(route, "cold render already done by another request");
                return Ok(Served {
                    entry,
                    status: CacheStatus::Miss,
                });
            }
        }

        let artifact = match self.revalidator.render(route).await {
            Ok(artifact) => artifact,
            Err(source) => {
                self.stats.write().await.render_failures += 1;
                return Err(IsrError::Render {
                    route: route.to_string(),
                    source,
                });
            }
        };

        let ttl_seconds = self.revalidator.ttl_for(route);
        let entry = match self.store.set(route, artifact.clone(), ttl_seconds).await {
            Ok(entry) => {
                self.stats.write().await.regenerations += 1;
                entry
            }
            Err(e) => {
                // The user still gets the page; the next request retries the write
                warn!(route, error = %e, "failed to cache cold render");
                self.stats.write().await.render_failures += 1;
                CacheEntry::new(route, artifact, ttl_seconds)
            }
        };

        Ok(Served {
            entry,
            status: CacheStatus::Miss,
        })
    }

    /// On-demand revalidation: render now and wait for the result
    pub async fn revalidate(&self, path: &str) -> Result<CacheEntry> {
        let route = normalize_route(path);
        let result = self.revalidator.revalidate(&route).await;

        let mut stats = self.stats.write().await;
        match result {
            Ok(entry) => {
                stats.regenerations += 1;
                Ok(entry)
            }
            Err(e) => {
                stats.render_failures += 1;
                Err(e)
            }
        }
    }

    /// Queue a background revalidation
    pub fn enqueue(&self, path: &str, priority: Priority) -> AddOutcome {
        self.queue.add(&normalize_route(path), priority)
    }

    pub fn queue(&self) -> &RevalidationQueue {
        &self.queue
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    /// Get cache statistics
    pub async fn stats(&self) -> CacheStats {
        let mut stats = self.stats.read().await.clone();
        let (completed, failed) = self.queue.job_counts();
        stats.regenerations += completed;
        stats.render_failures += failed;
        stats
    }
}
