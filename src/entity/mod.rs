//! Entity Module
//!
//! Per-entity-type configuration and the collaborators an entity type plugs
//! into the engine: the authoritative [`DataSource`] and optional
//! [`EntityHooks`] side effects.

mod entry;
mod normalize;
mod related;
mod scope;


use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use rand::Rng;
use serde_json::{Map, Value};

use crate::error::{CacheError, Result};
use crate::store::DEFAULT_POOL;

pub use entry::CacheEntry;
pub(crate) use entry::{hash_fields_to_detail, with_pk_field};
pub use normalize::{
    coerce_int, decode_blob, decode_hash, encode_field, encode_fields, project, record_to_detail,
};
pub use related::{ListCache, RelatedAdapter, SetCache};
pub use scope::RequestScope;

/// Cached state of one entity: field name to value.
pub type Detail = Map<String, Value>;

/// Suffix appended to a cache key to form its tombstone key.
pub const TOMBSTONE_SUFFIX: &str = ".null";

/// Fields coerced to integers for every entity type.
pub const DEFAULT_INT_FIELDS: [&str; 2] = ["status", "sort"];

/// Tombstone key recording confirmed absence of `key`.
pub fn tombstone_key(key: &str) -> String {
    format!("{}{}", key, TOMBSTONE_SUFFIX)
}

/// `base` plus a uniform random offset in `[0, jitter]` seconds.
pub fn jittered_ttl(base: u64, jitter: u64) -> u64 {
    base + rand::thread_rng().gen_range(0..=jitter)
}

// == Storage Mode ==
/// How an entity is laid out in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageMode {
    /// Whole detail serialized as one JSON string
    Blob,
    /// One hash field per detail field
    #[default]
    FieldMap,
}

// == Data Source ==
/// Authoritative source of entity state.
///
/// `Ok(None)` means the entity does not exist, which is different from a
/// record with no fields.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn load_current(&self, pk: &str) -> anyhow::Result<Option<Value>>;
}

// == Hooks ==
/// Per-type extension points. Every method defaults to doing nothing.
#[async_trait]
pub trait EntityHooks: Send + Sync {
    /// Transforms a full detail right before it is persisted.
    fn before_save(&self, _detail: &mut Detail) {}

    /// Extra normalization applied after every read.
    fn after_read(&self, _detail: &mut Detail) {}

    /// Side effect after a persist or field update; `changed` holds the
    /// written fields.
    async fn after_save(&self, _pk: &str, _changed: &Detail) -> anyhow::Result<()> {
        Ok(())
    }

    /// Side effect after the entry is deleted.
    async fn on_delete(&self, _pk: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl EntityHooks for NoHooks {}

// == Entity Descriptor ==
/// Everything the engine needs to know about one entity type.
pub struct EntityDescriptor {
    namespace: String,
    pool: String,
    mode: StorageMode,
    ttl: Option<u64>,
    int_fields: Vec<String>,
    pk_field: String,
    allow_empty_pk: bool,
    soft_delete_field: Option<String>,
    source: Arc<dyn DataSource>,
    hooks: Arc<dyn EntityHooks>,
}

impl EntityDescriptor {
    /// Starts describing the type stored under `namespace`.
    pub fn builder(namespace: impl Into<String>, source: Arc<dyn DataSource>) -> EntityDescriptorBuilder {
        EntityDescriptorBuilder {
            namespace: namespace.into(),
            pool: DEFAULT_POOL.to_string(),
            mode: StorageMode::default(),
            ttl: None,
            int_fields: Vec::new(),
            pk_field: "id".to_string(),
            allow_empty_pk: false,
            soft_delete_field: Some("deleted_at".to_string()),
            source,
            hooks: Arc::new(NoHooks),
        }
    }

    /// Cache key for `pk`: `<namespace>:<pk>`, or the bare namespace for an
    /// empty pk.
    pub fn cache_key(&self, pk: &str) -> String {
        if pk.is_empty() {
            self.namespace.clone()
        } else {
            format!("{}:{}", self.namespace, pk)
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    /// Base TTL override; the context default applies when `None`.
    pub fn ttl(&self) -> Option<u64> {
        self.ttl
    }

    pub fn int_fields(&self) -> &[String] {
        &self.int_fields
    }

    pub fn pk_field(&self) -> &str {
        &self.pk_field
    }

    pub fn allow_empty_pk(&self) -> bool {
        self.allow_empty_pk
    }

    pub fn soft_delete_field(&self) -> Option<&str> {
        self.soft_delete_field.as_deref()
    }

    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.source
    }

    pub fn hooks(&self) -> &Arc<dyn EntityHooks> {
        &self.hooks
    }
}

impl std::fmt::Debug for EntityDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityDescriptor")
            .field("namespace", &self.namespace)
            .field("pool", &self.pool)
            .field("mode", &self.mode)
            .field("ttl", &self.ttl)
            .field("int_fields", &self.int_fields)
            .field("pk_field", &self.pk_field)
            .field("allow_empty_pk", &self.allow_empty_pk)
            .finish_non_exhaustive()
    }
}

// == Descriptor Builder ==
pub struct EntityDescriptorBuilder {
    namespace: String,
    pool: String,
    mode: StorageMode,
    ttl: Option<u64>,
    int_fields: Vec<String>,
    pk_field: String,
    allow_empty_pk: bool,
    soft_delete_field: Option<String>,
    source: Arc<dyn DataSource>,
    hooks: Arc<dyn EntityHooks>,
}

impl EntityDescriptorBuilder {
    pub fn pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    pub fn mode(mut self, mode: StorageMode) -> Self {
        self.mode = mode;
        self
    }

    /// Base TTL in seconds (0 = never expire).
    pub fn ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Declares an extra integer field, on top of `status` and `sort`.
    pub fn int_field(mut self, field: impl Into<String>) -> Self {
        self.int_fields.push(field.into());
        self
    }

    pub fn pk_field(mut self, field: impl Into<String>) -> Self {
        self.pk_field = field.into();
        self
    }

    /// Allows an empty primary key, for process-wide singleton entries.
    pub fn allow_empty_pk(mut self, allow: bool) -> Self {
        self.allow_empty_pk = allow;
        self
    }

    /// Field stripped from every read; `None` disables stripping.
    pub fn soft_delete_field(mut self, field: Option<&str>) -> Self {
        self.soft_delete_field = field.map(str::to_string);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn EntityHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn build(self) -> Result<Arc<EntityDescriptor>> {
        if self.namespace.is_empty() {
            return Err(CacheError::Config("entity namespace cannot be empty".to_string()));
        }
        if self.pk_field.is_empty() {
            return Err(CacheError::Config(format!(
                "entity '{}' needs a primary key field",
                self.namespace
            )));
        }

        let mut int_fields: Vec<String> = DEFAULT_INT_FIELDS.iter().map(|f| f.to_string()).collect();
        for field in self.int_fields {
            if !int_fields.contains(&field) {
                int_fields.push(field);
            }
        }

        Ok(Arc::new(EntityDescriptor {
            namespace: self.namespace,
            pool: self.pool,
            mode: self.mode,
            ttl: self.ttl,
            int_fields,
            pk_field: self.pk_field,
            allow_empty_pk: self.allow_empty_pk,
            soft_delete_field: self.soft_delete_field,
            source: self.source,
            hooks: self.hooks,
        }))
    }
}

// == Map Source ==
/// In-process data source over a map of records, counting every load.
#[derive(Debug, Default)]
pub struct MapSource {
    records: Mutex<HashMap<String, Value>>,
    loads: AtomicUsize,
}

impl MapSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pk: impl Into<String>, record: Value) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pk.into(), record);
    }

    pub fn remove(&self, pk: &str) -> Option<Value> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(pk)
    }

    /// Number of `load_current` calls served so far.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSource for MapSource {
    async fn load_current(&self, pk: &str) -> anyhow::Result<Option<Value>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pk)
            .cloned())
    }
}
