//! Entry Cache - read-through/write-through entity caching over a key-value store
//!
//! Serves entity lookups from the store, rebuilds missing entries from the
//! authoritative data source under a per-key stampede lock, records confirmed
//! absence as short-lived tombstones and jitters every TTL.

pub mod batch;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod lock;
pub mod stats;
pub mod store;
pub mod tasks;

pub use batch::BatchResult;
pub use config::CacheConfig;
pub use context::CacheContext;
pub use entity::{
    CacheEntry, DataSource, Detail, EntityDescriptor, EntityHooks, MapSource, RequestScope,
    StorageMode,
};
pub use error::{CacheError, Result};
pub use store::{MemoryStore, RedisStore, StoreGateway, StoreRegistry};
pub use tasks::spawn_sweeper;
