//! Render clients and stores used by the unit tests

use crate::cache::{Artifact, CacheEntry};
use crate::error::{RenderError, StorageError};
use crate::render::RenderClient;
use crate::storage::memory::MemoryStore;
use crate::storage::CacheStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Renders `<p>{route}</p>` and counts calls per route
#[derive(Default)]
pub struct StaticRenderer {
    calls: Mutex<HashMap<String, usize>>,
}

impl StaticRenderer {
    pub fn calls_for(&self, route: &str) -> usize {
        self.calls.lock().unwrap().get(route).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl RenderClient for StaticRenderer {
    async fn render_route(&self, route: &str) -> Result<Artifact, RenderError> {
        *self.calls.lock().unwrap().entry(route.to_string()).or_default() += 1;
        Ok(Artifact::new(format!("<p>{}</p>", route)))
    }
}

/// Always fails like a broken template
pub struct FailingRenderer;

#[async_trait]
impl RenderClient for FailingRenderer {
    async fn render_route(&self, _route: &str) -> Result<Artifact, RenderError> {
        Err(RenderError::Failed("template error".to_string()))
    }
}

pub struct PanickingRenderer;

#[async_trait]
impl RenderClient for PanickingRenderer {
    async fn render_route(&self, route: &str) -> Result<Artifact, RenderError> {
        panic!("renderer blew up on {}", route);
    }
}

pub struct SlowRenderer {
    delay: Duration,
}

impl SlowRenderer {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl RenderClient for SlowRenderer {
    async fn render_route(&self, route: &str) -> Result<Artifact, RenderError> {
        tokio::time::sleep(self.delay).await;
        Ok(Artifact::new(format!("<p>{}</p>", route)))
    }
}

/// Blocks every render until the test releases it, tracking concurrency
pub struct GatedRenderer {
    gate: Semaphore,
    current: AtomicUsize,
    max_seen: AtomicUsize,
    started: Mutex<Vec<String>>,
}

impl Default for GatedRenderer {
    fn default() -> Self {
        Self {
            gate: Semaphore::new(0),
            current: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        }
    }
}

impl GatedRenderer {
    /// Let `n` blocked (or future) renders finish
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn running(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RenderClient for GatedRenderer {
    async fn render_route(&self, route: &str) -> Result<Artifact, RenderError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        self.started.lock().unwrap().push(route.to_string());

        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| RenderError::Failed(e.to_string()))?;
        permit.forget();

        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(Artifact::new(format!("<p>{}</p>", route)))
    }
}

/// Gated renderer whose output is the data version current when the render
/// started, like a page reading its rows before the template runs
pub struct VersionedRenderer {
    version: AtomicUsize,
    gated: GatedRenderer,
}

impl VersionedRenderer {
    pub fn new(version: usize) -> Self {
        Self {
            version: AtomicUsize::new(version),
            gated: GatedRenderer::default(),
        }
    }

    /// Change the underlying data
    pub fn publish(&self, version: usize) {
        self.version.store(version, Ordering::SeqCst);
    }

    pub fn release(&self, n: usize) {
        self.gated.release(n);
    }

    pub fn renders(&self) -> usize {
        self.gated.started().len()
    }

    pub fn running(&self) -> usize {
        self.gated.running()
    }

    pub fn max_concurrent(&self) -> usize {
        self.gated.max_concurrent()
    }
}

#[async_trait]
impl RenderClient for VersionedRenderer {
    async fn render_route(&self, route: &str) -> Result<Artifact, RenderError> {
        let version = self.version.load(Ordering::SeqCst);
        self.gated.render_route(route).await?;
        Ok(Artifact::new(format!("v{}", version)))
    }
}

/// Memory store whose writes can be switched to fail
#[derive(Default)]
pub struct FailingStore {
    pub inner: MemoryStore,
    fail_writes: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CacheStore for FailingStore {
    async fn get(&self, route: &str) -> Result<Option<CacheEntry>, StorageError> {
        self.inner.get(route).await
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Io {
                route: entry.route.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            });
        }
        self.inner.put(entry).await
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.inner.keys().await
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// Memory store that panics on every write
#[derive(Default)]
pub struct PanickingStore {
    pub inner: MemoryStore,
}

#[async_trait]
impl CacheStore for PanickingStore {
    async fn get(&self, route: &str) -> Result<Option<CacheEntry>, StorageError> {
        self.inner.get(route).await
    }

    async fn put(&self, entry: &CacheEntry) -> Result<(), StorageError> {
        panic!("store blew up writing {}", entry.route);
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.inner.keys().await
    }

    fn name(&self) -> &'static str {
        "panicking"
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 2s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
