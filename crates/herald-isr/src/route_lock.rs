//! Per-route writer locks
//!
//! Every path that renders and writes a route holds that route's lock, so a
//! cache key has at most one writer at a time. Unused locks are removed when
//! their last guard drops.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type RouteMutex = Arc<AsyncMutex<()>>;
type LockMap = Arc<Mutex<HashMap<String, RouteMutex>>>;

fn lock_map(map: &LockMap) -> MutexGuard<'_, HashMap<String, RouteMutex>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct RouteLocks {
    locks: LockMap,
}

/// Held while a route is being rendered and written
pub struct RouteGuard {
    route: String,
    lock: RouteMutex,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl RouteLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other writer holds `route`, then hold it.
    ///
    /// Waiters are served in arrival order.
    pub async fn lock(&self, route: &str) -> RouteGuard {
        let lock = Arc::clone(lock_map(&self.locks).entry(route.to_string()).or_default());
        let guard = Arc::clone(&lock).lock_owned().await;

        RouteGuard {
            route: route.to_string(),
            lock,
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    pub fn is_locked(&self, route: &str) -> bool {
        lock_map(&self.locks)
            .get(route)
            .map_or(false, |lock| lock.try_lock().is_err())
    }

    /// Routes with a live lock entry
    pub fn len(&self) -> usize {
        lock_map(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut locks = lock_map(&self.locks);
        let unused = locks
            .get(&self.route)
            // Only the map and this guard still point at it
            .map_or(false, |current| {
                Arc::ptr_eq(current, &self.lock) && Arc::strong_count(&self.lock) == 2
            });
        if unused {
            locks.remove(&self.route);
        }
    }
}
