//! Expiry Sweeper Task
//!
//! The memory store expires keys lazily on access. This task reclaims keys
//! that expired but were never touched again.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::store::MemoryStore;

/// Spawns a task removing expired keys from `store` every `interval_secs`.
///
/// Abort the returned handle to stop it.
pub fn spawn_sweeper(store: MemoryStore, interval_secs: u64) -> JoinHandle<()> {
    let interval = Duration::from_secs(interval_secs.max(1));

    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "expiry sweeper started");

        loop {
            tokio::time::sleep(interval).await;

            let removed = store.cleanup_expired().await;
            if removed > 0 {
                info!(removed, "expiry sweep removed keys");
            } else {
                debug!("expiry sweep found nothing");
            }
        }
    })
}
