//! Stampede Lock Coordinator
//!
//! Advisory, TTL-bounded mutual exclusion keyed per cache key. The lock only
//! limits how many callers rebuild the same entry at once; it guards no data
//! structure. A holder that dies leaves the lock to expire on its own TTL.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::stats::StatsRecorder;
use crate::store::{StoreGateway, StoreRegistry};

/// Suffix appended to a cache key to form its lock key.
pub const LOCK_SUFFIX: &str = ".lock";

/// Lock key guarding rebuilds of `key`.
pub fn lock_key(key: &str) -> String {
    format!("{}{}", key, LOCK_SUFFIX)
}

// == Lock Coordinator ==
#[derive(Clone)]
pub struct LockCoordinator {
    registry: StoreRegistry,
    retry: Duration,
    stats: Arc<StatsRecorder>,
}

impl LockCoordinator {
    /// Creates a coordinator sleeping `retry` between acquisition attempts.
    pub fn new(registry: StoreRegistry, retry: Duration, stats: Arc<StatsRecorder>) -> Self {
        Self {
            registry,
            retry,
            stats,
        }
    }

    // == With Lock ==
    /// Runs `body` exactly once while holding the lock on `key`.
    ///
    /// Makes `max_tries` acquisition attempts (at least one), sleeping the retry
    /// interval between them. The lock key is deleted after `body` finishes,
    /// whatever its outcome. When every attempt fails, `body` never runs and
    /// [`CacheError::Busy`] is returned.
    pub async fn with_lock<F, Fut, T>(
        &self,
        pool: &str,
        key: &str,
        lock_ttl: u64,
        max_tries: u32,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let store = self.registry.store(pool).await?;
        let lock = lock_key(key);
        let attempts = max_tries.max(1);

        for attempt in 1..=attempts {
            if store.set_nx_ex(&lock, "1", lock_ttl).await? {
                debug!(key, attempt, "lock acquired");
                let guard = LockGuard::new(store, lock);
                let result = body().await;
                guard.release().await;
                return result;
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry).await;
            }
        }

        self.stats.record_lock_busy();
        warn!(key, attempts, "lock not acquired, giving up");
        Err(CacheError::Busy {
            key: key.to_string(),
            tries: attempts,
        })
    }

    /// Single attempt, no waiting.
    pub async fn try_with_lock<F, Fut, T>(
        &self,
        pool: &str,
        key: &str,
        lock_ttl: u64,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.with_lock(pool, key, lock_ttl, 0, body).await
    }
}

// == Lock Guard ==
/// Deletes the lock key on release, or from a spawned task if dropped while
/// still held (panic or cancellation inside the body).
struct LockGuard {
    held: Option<(Arc<dyn StoreGateway>, String)>,
}

impl LockGuard {
    fn new(store: Arc<dyn StoreGateway>, lock_key: String) -> Self {
        Self {
            held: Some((store, lock_key)),
        }
    }

    async fn release(mut self) {
        if let Some((store, lock_key)) = self.held.take() {
            if let Err(err) = store.del(&lock_key).await {
                warn!(lock_key = %lock_key, error = %err, "failed to release lock, left to expire");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some((store, lock_key)) = self.held.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = store.del(&lock_key).await;
            });
        }
    }
}
