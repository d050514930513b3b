//! Bounded-concurrency revalidation queue
//!
//! Jobs are keyed by route. A route is "in flight" from the moment it is
//! queued until its worker finishes; while in flight, further `add` calls for
//! it are no-ops. The queue and the in-flight set live behind one mutex so
//! the check-then-insert is atomic for concurrent callers.

use crate::render::Revalidator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevalidationJob {
    pub route: String,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

/// Result of [`RevalidationQueue::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddOutcome {
    /// A new job was queued
    Enqueued,
    /// The route was already queued or running; nothing changed
    Duplicate,
    /// The queue was full and nothing could be evicted
    Rejected,
}

/// Lifecycle events published by the queue
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Started { route: String },
    Completed { route: String, duration: Duration },
    Failed { route: String, error: String },
    /// A queued job was evicted (or refused) because the queue was full
    Dropped { route: String },
}

impl QueueEvent {
    pub fn route(&self) -> &str {
        match self {
            QueueEvent::Started { route }
            | QueueEvent::Completed { route, .. }
            | QueueEvent::Failed { route, .. }
            | QueueEvent::Dropped { route } => route,
        }
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<RevalidationJob>,
    in_flight: HashSet<String>,
    active: usize,
}

impl QueueState {
    /// High jobs go after the last queued high job, normal jobs at the back
    fn insert(&mut self, job: RevalidationJob) {
        match job.priority {
            Priority::High => {
                let position = self
                    .pending
                    .iter()
                    .position(|queued| queued.priority == Priority::Normal)
                    .unwrap_or(self.pending.len());
                self.pending.insert(position, job);
            }
            Priority::Normal => self.pending.push_back(job),
        }
    }

    /// Remove the oldest queued normal-priority job
    fn evict_oldest_normal(&mut self) -> Option<RevalidationJob> {
        let position = self
            .pending
            .iter()
            .position(|queued| queued.priority == Priority::Normal)?;
        let job = self.pending.remove(position)?;
        self.in_flight.remove(&job.route);
        Some(job)
    }
}

struct QueueInner {
    state: Mutex<QueueState>,
    revalidator: Arc<Revalidator>,
    max_workers: usize,
    max_queue_len: usize,
    events: broadcast::Sender<QueueEvent>,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // The state is only mutated in short, panic-free sections
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: QueueEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Snapshot of queue counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub queued: usize,
    pub active: usize,
    pub max_workers: usize,
}

/// Revalidation job scheduler.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct RevalidationQueue {
    inner: Arc<QueueInner>,
}

impl RevalidationQueue {
    pub fn new(revalidator: Arc<Revalidator>, max_workers: usize, max_queue_len: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                revalidator,
                max_workers: max_workers.max(1),
                max_queue_len: max_queue_len.max(1),
                events,
                completed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    /// Queue a revalidation for `route` unless one is already in flight.
    ///
    /// Never blocks on rendering; must be called from within a tokio runtime.
    pub fn add(&self, route: &str, priority: Priority) -> AddOutcome {
        let mut dropped = None;

        let outcome = {
            let mut state = self.inner.lock();

            if state.in_flight.contains(route) {
                debug!(route, "revalidation already in flight, skipping");
                return AddOutcome::Duplicate;
            }

            if state.pending.len() >= self.inner.max_queue_len {
                dropped = state.evict_oldest_normal();
            }

            if state.pending.len() >= self.inner.max_queue_len {
                AddOutcome::Rejected
            } else {
                state.in_flight.insert(route.to_string());
                state.insert(RevalidationJob {
                    route: route.to_string(),
                    priority,
                    enqueued_at: Utc::now(),
                });
                AddOutcome::Enqueued
            }
        };

        if let Some(job) = dropped {
            warn!(route = %job.route, "revalidation queue full, dropped oldest normal job");
            self.inner.emit(QueueEvent::Dropped { route: job.route });
        }

        match outcome {
            AddOutcome::Enqueued => {
                debug!(route, ?priority, "revalidation queued");
                self.process();
            }
            AddOutcome::Rejected => {
                warn!(route, ?priority, "revalidation queue full, job rejected");
                self.inner.emit(QueueEvent::Dropped {
                    route: route.to_string(),
                });
            }
            AddOutcome::Duplicate => {}
        }

        outcome
    }

    /// Start queued jobs while worker slots are free
    fn process(&self) {
        loop {
            let job = {
                let mut state = self.inner.lock();
                if state.active >= self.inner.max_workers {
                    return;
                }
                let Some(job) = state.pending.pop_front() else {
                    return;
                };
                state.active += 1;
                job
            };

            self.spawn_worker(job);
        }
    }

    fn spawn_worker(&self, job: RevalidationJob) {
        let queue = self.clone();

        tokio::spawn(async move {
            let route = job.route;
            let waited = (Utc::now() - job.enqueued_at).num_milliseconds();
            debug!(route = %route, priority = ?job.priority, waited_ms = waited, "revalidation started");
            queue.inner.emit(QueueEvent::Started {
                route: route.clone(),
            });

            let start = Instant::now();
            // A panic in the store must not skip the bookkeeping below
            let revalidator = Arc::clone(&queue.inner.revalidator);
            let owned_route = route.clone();
            let outcome =
                tokio::spawn(async move { revalidator.revalidate(&owned_route).await }).await;

            let event = match outcome {
                Ok(Ok(_)) => {
                    queue.inner.completed.fetch_add(1, Ordering::Relaxed);
                    let duration = start.elapsed();
                    info!(route = %route, duration_ms = duration.as_millis() as u64, "revalidation completed");
                    QueueEvent::Completed {
                        route: route.clone(),
                        duration,
                    }
                }
                Ok(Err(e)) => {
                    queue.inner.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(route = %route, error = %e, "revalidation failed");
                    QueueEvent::Failed {
                        route: route.clone(),
                        error: e.to_string(),
                    }
                }
                Err(e) => {
                    queue.inner.failed.fetch_add(1, Ordering::Relaxed);
                    error!(route = %route, error = %e, "revalidation task crashed");
                    QueueEvent::Failed {
                        route: route.clone(),
                        error: format!("revalidation task crashed: {}", e),
                    }
                }
            };

            {
                let mut state = queue.inner.lock();
                state.in_flight.remove(&route);
                state.active -= 1;
            }

            queue.inner.emit(event);
            queue.process();
        });
    }

    /// Drop every queued (not yet started) job; returns how many were dropped
    pub fn clear(&self) -> usize {
        let mut state = self.inner.lock();
        let cleared: Vec<RevalidationJob> = state.pending.drain(..).collect();
        for job in &cleared {
            state.in_flight.remove(&job.route);
        }
        cleared.len()
    }

    /// Number of queued jobs
    pub fn size(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Number of executing jobs
    pub fn active(&self) -> usize {
        self.inner.lock().active
    }

    pub fn is_in_flight(&self, route: &str) -> bool {
        self.inner.lock().in_flight.contains(route)
    }

    /// Queued routes in execution order
    pub fn pending_routes(&self) -> Vec<String> {
        self.inner
            .lock()
            .pending
            .iter()
            .map(|job| job.route.clone())
            .collect()
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.inner.lock();
        QueueStatus {
            queued: state.pending.len(),
            active: state.active,
            max_workers: self.inner.max_workers,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Finished jobs so far as `(completed, failed)`
    pub fn job_counts(&self) -> (u64, u64) {
        (
            self.inner.completed.load(Ordering::Relaxed),
            self.inner.failed.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Artifact;
    use crate::config::TtlPolicy;
    use crate::render::RenderClient;
    use crate::storage::memory::MemoryStore;
    use crate::storage::CacheStore;
    use crate::test_support::{
        wait_until, FailingRenderer, FailingStore, GatedRenderer, PanickingStore, StaticRenderer,
    };
    use pretty_assertions::assert_eq;

    fn queue_with(
        renderer: Arc<dyn RenderClient>,
        store: Arc<dyn CacheStore>,
        max_workers: usize,
        max_queue_len: usize,
    ) -> RevalidationQueue {
        let revalidator = Revalidator::new(
            renderer,
            store,
            TtlPolicy::new(Duration::from_secs(60), Vec::new()),
            None,
        );
        RevalidationQueue::new(Arc::new(revalidator), max_workers, max_queue_len)
    }

    async fn next_event_for(rx: &mut broadcast::Receiver<QueueEvent>, route: &str) -> QueueEvent {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match rx.recv().await {
                    Ok(QueueEvent::Started { .. }) => continue,
                    Ok(event) if event.route() == route => return event,
                    Ok(_) => continue,
                    Err(e) => panic!("event channel closed: {}", e),
                }
            }
        })
        .await
        .expect("no completion event within 2s")
    }

    #[tokio::test]
    async fn test_duplicate_adds_run_one_job() {
        let renderer = Arc::new(GatedRenderer::default());
        let queue = queue_with(renderer.clone(), Arc::new(MemoryStore::new()), 2, 100);

        assert_eq!(queue.add("/news", Priority::Normal), AddOutcome::Enqueued);
        for _ in 0..9 {
            assert_eq!(queue.add("/news", Priority::High), AddOutcome::Duplicate);
        }

        wait_until(|| renderer.running() == 1).await;
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.active(), 1);

        renderer.release(1);
        wait_until(|| !queue.is_in_flight("/news")).await;
        assert_eq!(renderer.started(), vec!["/news".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_from_many_tasks() {
        let renderer = Arc::new(GatedRenderer::default());
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(renderer.clone(), store.clone(), 2, 100);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.add("/article/abc", Priority::Normal) })
            })
            .collect();

        let mut enqueued = 0;
        for handle in handles {
            if handle.await.unwrap() == AddOutcome::Enqueued {
                enqueued += 1;
            }
        }
        assert_eq!(enqueued, 1);

        renderer.release(1);
        wait_until(|| !queue.is_in_flight("/article/abc")).await;
        assert_eq!(renderer.started(), vec!["/article/abc".to_string()]);
        assert!(store.get("/article/abc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_high_priority_overtakes_queued_normal_jobs() {
        let renderer = Arc::new(GatedRenderer::default());
        let queue = queue_with(renderer.clone(), Arc::new(MemoryStore::new()), 1, 100);

        // Occupy the only worker slot
        queue.add("/busy", Priority::Normal);
        wait_until(|| renderer.running() == 1).await;

        queue.add("/a", Priority::Normal);
        queue.add("/b", Priority::Normal);
        queue.add("/c", Priority::High);
        assert_eq!(queue.pending_routes(), vec!["/c", "/a", "/b"]);

        // FIFO within the high class
        queue.add("/d", Priority::High);
        assert_eq!(queue.pending_routes(), vec!["/c", "/d", "/a", "/b"]);

        renderer.release(5);
        wait_until(|| queue.active() == 0 && queue.size() == 0).await;
        assert_eq!(renderer.started(), vec!["/busy", "/c", "/d", "/a", "/b"]);
    }

    #[tokio::test]
    async fn test_concurrency_bound() {
        let renderer = Arc::new(GatedRenderer::default());
        let queue = queue_with(renderer.clone(), Arc::new(MemoryStore::new()), 2, 100);

        for i in 0..5 {
            queue.add(&format!("/news/{}", i), Priority::Normal);
        }

        wait_until(|| renderer.running() == 2).await;
        // Give the runtime a chance to (wrongly) start more
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(renderer.started().len(), 2);
        assert_eq!(queue.size(), 3);

        renderer.release(1);
        wait_until(|| renderer.started().len() == 3).await;
        assert_eq!(renderer.running(), 2);

        renderer.release(4);
        wait_until(|| queue.active() == 0 && queue.size() == 0).await;
        assert_eq!(renderer.started().len(), 5);
        assert_eq!(renderer.max_concurrent(), 2);
    }

    #[tokio::test]
    async fn test_failed_job_emits_error_and_frees_route() {
        let store = Arc::new(MemoryStore::new());
        store.set("/news", Artifact::new("old"), 0).await.unwrap();

        let queue = queue_with(Arc::new(FailingRenderer), store.clone(), 2, 100);
        let mut rx = queue.subscribe();

        queue.add("/news", Priority::Normal);
        let event = next_event_for(&mut rx, "/news").await;
        match event {
            QueueEvent::Failed { route, error } => {
                assert_eq!(route, "/news");
                assert!(error.contains("template error"));
            }
            other => panic!("expected failure event, got {:?}", other),
        }

        // Cache untouched, route eligible again
        assert_eq!(store.get("/news").await.unwrap().unwrap().artifact.html, "old");
        wait_until(|| !queue.is_in_flight("/news")).await;
        assert_eq!(queue.add("/news", Priority::Normal), AddOutcome::Enqueued);
    }

    #[tokio::test]
    async fn test_cache_write_failure_keeps_previous_entry() {
        let store = Arc::new(FailingStore::new());
        store.inner.set("/news", Artifact::new("old"), 0).await.unwrap();
        store.fail_writes(true);

        let queue = queue_with(Arc::new(StaticRenderer::default()), store.clone(), 2, 100);
        let mut rx = queue.subscribe();

        queue.add("/news", Priority::High);
        let event = next_event_for(&mut rx, "/news").await;
        assert!(matches!(event, QueueEvent::Failed { .. }));

        let entry = store.get("/news").await.unwrap().unwrap();
        assert_eq!(entry.artifact.html, "old");
    }

    #[tokio::test]
    async fn test_store_panic_frees_worker_and_route() {
        let queue = queue_with(
            Arc::new(StaticRenderer::default()),
            Arc::new(PanickingStore::default()),
            1,
            100,
        );
        let mut rx = queue.subscribe();

        queue.add("/news", Priority::Normal);
        match next_event_for(&mut rx, "/news").await {
            QueueEvent::Failed { error, .. } => assert!(error.contains("crashed")),
            other => panic!("expected failure event, got {:?}", other),
        }

        wait_until(|| queue.active() == 0).await;
        assert!(!queue.is_in_flight("/news"));

        // The single worker slot is usable again
        queue.add("/events", Priority::Normal);
        assert!(matches!(
            next_event_for(&mut rx, "/events").await,
            QueueEvent::Failed { .. }
        ));
        assert_eq!(queue.job_counts(), (0, 2));
    }

    #[tokio::test]
    async fn test_completed_job_updates_cache() {
        let store = Arc::new(MemoryStore::new());
        let queue = queue_with(Arc::new(StaticRenderer::default()), store.clone(), 2, 100);
        let mut rx = queue.subscribe();

        queue.add("/events", Priority::Normal);
        let event = next_event_for(&mut rx, "/events").await;
        assert!(matches!(event, QueueEvent::Completed { .. }));
        assert_eq!(
            store.get("/events").await.unwrap().unwrap().artifact.html,
            "<p>/events</p>"
        );
    }

    #[tokio::test]
    async fn test_clear_drops_only_queued_jobs() {
        let renderer = Arc::new(GatedRenderer::default());
        let queue = queue_with(renderer.clone(), Arc::new(MemoryStore::new()), 1, 100);

        queue.add("/running", Priority::Normal);
        wait_until(|| renderer.running() == 1).await;
        queue.add("/a", Priority::Normal);
        queue.add("/b", Priority::High);

        assert_eq!(queue.clear(), 2);
        assert_eq!(queue.size(), 0);
        assert!(queue.is_in_flight("/running"));
        assert!(!queue.is_in_flight("/a"));
        assert_eq!(queue.add("/a", Priority::Normal), AddOutcome::Enqueued);

        renderer.release(2);
        wait_until(|| queue.active() == 0 && queue.size() == 0).await;
        assert_eq!(renderer.started(), vec!["/running", "/a"]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_oldest_normal() {
        let renderer = Arc::new(GatedRenderer::default());
        let queue = queue_with(renderer.clone(), Arc::new(MemoryStore::new()), 1, 2);
        let mut rx = queue.subscribe();

        queue.add("/running", Priority::Normal);
        wait_until(|| renderer.running() == 1).await;

        queue.add("/a", Priority::Normal);
        queue.add("/b", Priority::Normal);
        assert_eq!(queue.add("/c", Priority::High), AddOutcome::Enqueued);
        assert_eq!(queue.pending_routes(), vec!["/c", "/b"]);
        assert!(!queue.is_in_flight("/a"));
        assert_eq!(
            next_event_for(&mut rx, "/a").await,
            QueueEvent::Dropped { route: "/a".to_string() }
        );

        assert_eq!(queue.add("/d", Priority::High), AddOutcome::Enqueued);
        assert_eq!(queue.pending_routes(), vec!["/c", "/d"]);
        assert!(!queue.is_in_flight("/b"));

        // Only high jobs left: nothing to evict
        assert_eq!(queue.add("/e", Priority::Normal), AddOutcome::Rejected);
        assert!(!queue.is_in_flight("/e"));

        renderer.release(3);
        wait_until(|| queue.active() == 0 && queue.size() == 0).await;
    }
}
