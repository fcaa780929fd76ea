//! Cache Context
//!
//! Shared handle bundling what every entity instance needs: configuration,
//! the store registry, the lock coordinator and the engine counters. Built
//! once at startup and passed around as `Arc<CacheContext>`.

use std::sync::Arc;

use crate::batch::{self, BatchResult};
use crate::config::CacheConfig;
use crate::entity::{tombstone_key, CacheEntry, EntityDescriptor};
use crate::error::Result;
use crate::lock::{lock_key, LockCoordinator};
use crate::stats::{CacheStats, StatsRecorder};
use crate::store::{clear_keys, StoreRegistry};

pub struct CacheContext {
    config: CacheConfig,
    registry: StoreRegistry,
    lock: LockCoordinator,
    stats: Arc<StatsRecorder>,
}

impl CacheContext {
    pub fn new(config: CacheConfig, registry: StoreRegistry) -> Arc<Self> {
        let stats = Arc::new(StatsRecorder::new());
        let lock = LockCoordinator::new(registry.clone(), config.lock_retry(), Arc::clone(&stats));
        Arc::new(Self {
            config,
            registry,
            lock,
            stats,
        })
    }

    // == Accessors ==
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn registry(&self) -> &StoreRegistry {
        &self.registry
    }

    pub fn lock(&self) -> &LockCoordinator {
        &self.lock
    }

    pub fn recorder(&self) -> &StatsRecorder {
        &self.stats
    }

    /// Point-in-time copy of the engine counters.
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    // == Entities ==
    /// Entity instance for `pk` in the descriptor's pool.
    pub async fn entry(
        self: &Arc<Self>,
        descriptor: &Arc<EntityDescriptor>,
        pk: &str,
    ) -> Result<CacheEntry> {
        CacheEntry::new(Arc::clone(self), Arc::clone(descriptor), pk).await
    }

    /// Entity instance for `pk` in an explicit pool.
    pub async fn entry_in_pool(
        self: &Arc<Self>,
        descriptor: &Arc<EntityDescriptor>,
        pool: &str,
        pk: &str,
    ) -> Result<CacheEntry> {
        CacheEntry::in_pool(Arc::clone(self), Arc::clone(descriptor), pool, pk).await
    }

    /// Batch fetch in the descriptor's pool; see [`batch::get_many`].
    pub async fn get_many<S: AsRef<str>>(
        self: &Arc<Self>,
        descriptor: &Arc<EntityDescriptor>,
        ids: &[S],
        fields: &[String],
        key_field: Option<&str>,
    ) -> Result<BatchResult> {
        batch::get_many(self, descriptor, descriptor.pool(), ids, fields, key_field).await
    }

    /// Deletes every cached entry of the entity type, tombstones and lock
    /// keys included. Returns how many keys were removed.
    pub async fn clear_namespace(&self, descriptor: &EntityDescriptor) -> Result<u64> {
        let store = self.registry.store(descriptor.pool()).await?;
        let prefix = format!("{}:", descriptor.namespace());
        let mut removed = clear_keys(store.as_ref(), &prefix).await?;

        // The empty-pk singleton lives at the bare namespace
        if descriptor.allow_empty_pk() {
            let key = descriptor.cache_key("");
            for key in [tombstone_key(&key), lock_key(&key), key] {
                removed += store.del(&key).await?;
            }
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for CacheContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheContext")
            .field("config", &self.config)
            .field("pools", &self.registry.pools())
            .finish_non_exhaustive()
    }
}
