//! Related Collection Adapters
//!
//! Secondary caches an entity owns alongside its main entry, such as an id
//! list or a tag set. They live in the same pool as the owning entry.

use std::sync::Arc;

use crate::error::Result;
use crate::store::StoreGateway;

/// A collection adapter bound to one owning entity.
///
/// [`CacheEntry::related`](super::CacheEntry::related) creates the adapter on
/// first request and hands out the same instance afterwards.
pub trait RelatedAdapter: Send + Sync + 'static {
    fn bind(store: Arc<dyn StoreGateway>, pool: &str, pk: &str) -> Self;
}

// == List Cache ==
/// Queue-like list: push at the head, pop from the tail.
#[derive(Clone)]
pub struct ListCache {
    store: Arc<dyn StoreGateway>,
    key: String,
}

impl ListCache {
    pub fn new(store: Arc<dyn StoreGateway>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the list length after the push.
    pub async fn push(&self, value: &str) -> Result<u64> {
        self.store.lpush(&self.key, value).await
    }

    pub async fn pop(&self) -> Result<Option<String>> {
        self.store.rpop(&self.key).await
    }

    pub async fn len(&self) -> Result<u64> {
        self.store.llen(&self.key).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn clear(&self) -> Result<u64> {
        self.store.del(&self.key).await
    }
}

// == Set Cache ==
#[derive(Clone)]
pub struct SetCache {
    store: Arc<dyn StoreGateway>,
    key: String,
}

impl SetCache {
    pub fn new(store: Arc<dyn StoreGateway>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// True when `member` was not already present.
    pub async fn add(&self, member: &str) -> Result<bool> {
        self.store.sadd(&self.key, member).await
    }

    pub async fn remove(&self, member: &str) -> Result<bool> {
        self.store.srem(&self.key, member).await
    }

    pub async fn contains(&self, member: &str) -> Result<bool> {
        self.store.sismember(&self.key, member).await
    }

    pub async fn len(&self) -> Result<u64> {
        self.store.scard(&self.key).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn members(&self) -> Result<Vec<String>> {
        self.store.smembers(&self.key).await
    }

    pub async fn clear(&self) -> Result<u64> {
        self.store.del(&self.key).await
    }
}
