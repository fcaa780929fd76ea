//! Store Registry Module
//!
//! Maps pool identifiers to store gateways. Each pool's gateway is created at
//! most once, on first use, and then shared for the life of the process.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::OnceCell;
use tracing::info;

use super::StoreGateway;
use crate::error::{CacheError, Result};

/// Pool used when an entity type does not name one.
pub const DEFAULT_POOL: &str = "default";

/// Pending gateway connection returned by a [`StoreFactory`].
pub type StoreFuture = Pin<Box<dyn Future<Output = Result<Arc<dyn StoreGateway>>> + Send>>;

/// Connects the gateway for a pool identifier.
pub type StoreFactory = Arc<dyn Fn(&str) -> StoreFuture + Send + Sync>;

type PoolCell = Arc<OnceCell<Arc<dyn StoreGateway>>>;

// == Store Registry ==
/// Provider of store gateways keyed by pool identifier.
#[derive(Clone, Default)]
pub struct StoreRegistry {
    pools: Arc<RwLock<HashMap<String, PoolCell>>>,
    factory: Option<StoreFactory>,
}

impl StoreRegistry {
    /// Registry that only serves explicitly registered pools.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that connects unknown pools lazily through `factory`.
    ///
    /// Concurrent first requests for one pool share a single factory call; a
    /// failed call leaves the pool uninitialized so the next request retries.
    pub fn with_factory<F, Fut>(factory: F) -> Self
    where
        F: Fn(&str) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn StoreGateway>>> + Send + 'static,
    {
        Self {
            pools: Arc::default(),
            factory: Some(Arc::new(move |pool: &str| -> StoreFuture { Box::pin(factory(pool)) })),
        }
    }

    /// Registry serving `store` as the default pool.
    pub fn single(store: Arc<dyn StoreGateway>) -> Self {
        let registry = Self::new();
        registry.register(DEFAULT_POOL, store);
        registry
    }

    /// Registers (or replaces) the gateway for `pool`.
    pub fn register(&self, pool: &str, store: Arc<dyn StoreGateway>) {
        self.pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pool.to_string(), Arc::new(OnceCell::new_with(Some(store))));
    }

    // == Lookup ==
    /// Returns the gateway for `pool`, connecting it through the factory on
    /// first use.
    pub async fn store(&self, pool: &str) -> Result<Arc<dyn StoreGateway>> {
        let cell = self.cell(pool)?;
        if let Some(store) = cell.get() {
            return Ok(Arc::clone(store));
        }

        let factory = self
            .factory
            .as_ref()
            .ok_or_else(|| unknown_pool(pool))?;
        let store = cell
            .get_or_try_init(|| async {
                let store = factory(pool).await?;
                info!(pool, "store pool initialized");
                Ok::<_, CacheError>(store)
            })
            .await?;
        Ok(Arc::clone(store))
    }

    /// The pool's cell, created empty when a factory can fill it later.
    fn cell(&self, pool: &str) -> Result<PoolCell> {
        if let Some(cell) = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pool)
        {
            return Ok(Arc::clone(cell));
        }
        if self.factory.is_none() {
            return Err(unknown_pool(pool));
        }
        let mut pools = self.pools.write().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(pools.entry(pool.to_string()).or_default()))
    }

    /// Pool identifiers currently initialized.
    pub fn pools(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, cell)| cell.initialized())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

fn unknown_pool(pool: &str) -> CacheError {
    CacheError::Config(format!("unknown store pool '{}'", pool))
}
