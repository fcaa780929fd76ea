//! Store Gateway Module
//!
//! Thin abstraction over the key-value store's primitive commands. The engine
//! only talks to the store through [`StoreGateway`], so tests can run against
//! [`MemoryStore`] while production uses [`RedisStore`].

mod entry;
mod memory;
mod redis_store;
mod registry;

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

pub use entry::{current_timestamp_ms, StoredEntry, StoredValue};
pub use memory::MemoryStore;
pub use registry::{StoreFactory, StoreFuture, StoreRegistry, DEFAULT_POOL};
pub use redis_store::RedisStore;

/// `ttl` reply for a missing key.
pub const TTL_MISSING: i64 = -2;
/// `ttl` reply for a key without expiry.
pub const TTL_PERSISTENT: i64 = -1;

// == Pipeline Types ==
/// A single read queued in a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOp {
    /// Whole string value
    Get(String),
    /// Every field of a hash
    HashAll(String),
    /// Selected fields of a hash
    HashFields(String, Vec<String>),
}

/// Reply to a [`ReadOp`], in the same position as the op.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadReply {
    Value(Option<String>),
    Hash(HashMap<String, String>),
    Fields(Vec<Option<String>>),
}

// == Store Gateway ==
/// Primitive key-value store operations.
///
/// Every call may fail transiently; nothing here retries.
#[async_trait]
pub trait StoreGateway: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    /// Set-if-absent with expiry. Returns true when the key was created.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool>;

    /// Returns the number of keys removed.
    async fn del(&self, key: &str) -> Result<u64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Returns false when the key does not exist.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool>;

    /// Remaining seconds, [`TTL_PERSISTENT`] or [`TTL_MISSING`].
    async fn ttl(&self, key: &str) -> Result<i64>;

    async fn incr(&self, key: &str) -> Result<i64>;

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hmset(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    async fn hincr_by_float(&self, key: &str, field: &str, delta: f64) -> Result<f64>;

    async fn lpush(&self, key: &str, value: &str) -> Result<u64>;

    async fn rpop(&self, key: &str) -> Result<Option<String>>;

    async fn llen(&self, key: &str) -> Result<u64>;

    async fn sadd(&self, key: &str, member: &str) -> Result<bool>;

    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    async fn sismember(&self, key: &str, member: &str) -> Result<bool>;

    async fn scard(&self, key: &str) -> Result<u64>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Every live key starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Executes all reads in one round trip; replies keep the op order.
    async fn pipeline(&self, ops: &[ReadOp]) -> Result<Vec<ReadReply>>;
}

// == Helper Glue ==

/// Increments a counter, arming `ttl_secs` on the first increment.
///
/// If the counter is found without an expiry afterwards (a previous expire
/// call was lost), the expiry is set again.
pub async fn incr_ex(store: &dyn StoreGateway, key: &str, ttl_secs: u64) -> Result<i64> {
    let count = store.incr(key).await?;
    if count == 1 {
        if store.expire(key, ttl_secs).await.is_err() {
            store.expire(key, ttl_secs).await?;
        }
        if store.ttl(key).await? == TTL_PERSISTENT {
            store.expire(key, ttl_secs).await?;
        }
    }
    Ok(count)
}

/// Deletes every key starting with `prefix`. Returns how many were removed.
pub async fn clear_keys(store: &dyn StoreGateway, prefix: &str) -> Result<u64> {
    let keys = store.scan_prefix(prefix).await?;
    let mut removed = 0;
    for key in &keys {
        removed += store.del(key).await?;
    }
    debug!(prefix, removed, "cleared keys by prefix");
    Ok(removed)
}

/// Deletes a single key.
pub async fn clear_key(store: &dyn StoreGateway, key: &str) -> Result<u64> {
    store.del(key).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_incr_ex_arms_ttl_on_first_increment() {
        let store = MemoryStore::new();

        assert_eq!(incr_ex(&store, "hits", 30).await.unwrap(), 1);
        let ttl = store.ttl("hits").await.unwrap();
        assert!((29..=30).contains(&ttl));

        assert_eq!(incr_ex(&store, "hits", 30).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_clear_keys_by_prefix() {
        let store = MemoryStore::new();
        store.set("widget:1", "a").await.unwrap();
        store.set("widget:2", "b").await.unwrap();
        store.set("gadget:1", "c").await.unwrap();

        assert_eq!(clear_keys(&store, "widget:").await.unwrap(), 2);
        assert!(!store.exists("widget:1").await.unwrap());
        assert!(store.exists("gadget:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_key_missing_is_zero() {
        let store = MemoryStore::new();
        assert_eq!(clear_key(&store, "nothing").await.unwrap(), 0);
    }
}
