//! Cache Entry Engine
//!
//! One [`CacheEntry`] is bound to one primary key of one entity type. It reads
//! the entity from the store, rebuilds it from the data source on a miss under
//! the stampede lock, records confirmed absence as a tombstone, and applies
//! partial updates in the entry's storage mode.
//!
//! The in-memory mirror (`detail`) is only a per-instance cache of what was
//! last read or written; the store stays authoritative.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Number, Value};
use tracing::{debug, info, warn};

use super::normalize::{
    coerce_int, decode_blob, decode_hash, encode_field, encode_fields, project, record_to_detail,
};
use super::related::RelatedAdapter;
use super::{jittered_ttl, tombstone_key, Detail, EntityDescriptor, EntityHooks, StorageMode};
use crate::context::CacheContext;
use crate::error::{CacheError, Result};
use crate::lock::lock_key;
use crate::store::StoreGateway;

/// Numeric increment applied by [`CacheEntry::incr`] / [`CacheEntry::incr_by_float`].
#[derive(Debug, Clone, Copy)]
enum Delta {
    Int(i64),
    Float(f64),
}

// == Cache Entry ==
pub struct CacheEntry {
    ctx: Arc<CacheContext>,
    descriptor: Arc<EntityDescriptor>,
    store: Arc<dyn StoreGateway>,
    pool: String,
    pk: String,
    cache_key: String,
    detail: Option<Detail>,
    related: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl CacheEntry {
    // == Constructors ==
    /// Binds an entry to `pk` in the descriptor's own pool.
    pub async fn new(
        ctx: Arc<CacheContext>,
        descriptor: Arc<EntityDescriptor>,
        pk: impl Into<String>,
    ) -> Result<Self> {
        let pool = descriptor.pool().to_string();
        Self::in_pool(ctx, descriptor, pool, pk).await
    }

    /// Binds an entry to `pk` in an explicit pool.
    pub async fn in_pool(
        ctx: Arc<CacheContext>,
        descriptor: Arc<EntityDescriptor>,
        pool: impl Into<String>,
        pk: impl Into<String>,
    ) -> Result<Self> {
        let pool = pool.into();
        let pk = pk.into();
        let store = ctx.registry().store(&pool).await?;
        let cache_key = descriptor.cache_key(&pk);
        Ok(Self {
            ctx,
            descriptor,
            store,
            pool,
            pk,
            cache_key,
            detail: None,
            related: HashMap::new(),
        })
    }

    // == Accessors ==
    pub fn pk(&self) -> &str {
        &self.pk
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub fn tombstone_key(&self) -> String {
        tombstone_key(&self.cache_key)
    }

    pub fn lock_key(&self) -> String {
        lock_key(&self.cache_key)
    }

    pub fn mode(&self) -> StorageMode {
        self.descriptor.mode()
    }

    pub fn descriptor(&self) -> &Arc<EntityDescriptor> {
        &self.descriptor
    }

    /// Last detail read or written through this instance.
    pub fn mirror(&self) -> Option<&Detail> {
        self.detail.as_ref()
    }

    pub(crate) fn has_pk(&self) -> bool {
        !self.pk.is_empty() || self.descriptor.allow_empty_pk()
    }

    // == Reads ==

    /// Returns the requested fields (all when `fields` is empty), rebuilding
    /// from the source on a miss. Missing entities and empty keys yield an
    /// empty detail.
    pub async fn get_detail(&mut self, fields: &[String]) -> Result<Detail> {
        if !self.has_pk() {
            return Ok(Detail::new());
        }

        let mut detail = match self.read_cache(fields).await? {
            Some(detail) => {
                self.ctx.recorder().record_hit();
                detail
            }
            None => {
                self.ctx.recorder().record_miss();
                let rebuilt = self.get_detail_where_no_cache().await?.unwrap_or_default();
                if fields.is_empty() {
                    rebuilt
                } else {
                    project(rebuilt, fields)
                }
            }
        };

        self.normalize(&mut detail);
        self.detail = Some(detail.clone());
        Ok(detail)
    }

    /// Like [`get_detail`](Self::get_detail) but `None` instead of an empty detail.
    pub async fn get_columns(&mut self, fields: &[String]) -> Result<Option<Detail>> {
        if !self.has_pk() {
            return Ok(None);
        }
        let detail = self.get_detail(fields).await?;
        Ok((!detail.is_empty()).then_some(detail))
    }

    /// Single field value; `None` when the field is missing or null.
    pub async fn get_field(&mut self, name: &str) -> Result<Option<Value>> {
        if !self.has_pk() {
            return Ok(None);
        }
        let detail = self.get_detail(&[]).await?;
        Ok(detail.get(name).filter(|v| !v.is_null()).cloned())
    }

    /// Whether the entry is in the store. Tombstones are not consulted.
    pub async fn exists(&self) -> Result<bool> {
        if !self.has_pk() {
            return Ok(false);
        }
        self.store.exists(&self.cache_key).await
    }

    pub async fn is_empty(&mut self) -> Result<bool> {
        Ok(self.get_detail(&[]).await?.is_empty())
    }

    /// Raw store read in the entry's storage mode, projected to `fields`.
    /// `None` on a miss; a present entity whose requested fields are all
    /// unset reads as an empty detail.
    async fn read_cache(&self, fields: &[String]) -> Result<Option<Detail>> {
        let detail = match self.descriptor.mode() {
            StorageMode::Blob => match self.store.get(&self.cache_key).await? {
                Some(raw) => decode_blob(&raw),
                None => Detail::new(),
            },
            StorageMode::FieldMap if fields.is_empty() => {
                decode_hash(self.store.hget_all(&self.cache_key).await?)
            }
            StorageMode::FieldMap => {
                // The pk field tells a present entity with unset fields from a missing one
                let wanted = with_pk_field(fields, self.descriptor.pk_field());
                let values = self.store.hmget(&self.cache_key, &wanted).await?;
                hash_fields_to_detail(&wanted, values)
            }
        };
        if detail.is_empty() {
            return Ok(None);
        }
        Ok(Some(if fields.is_empty() {
            detail
        } else {
            project(detail, fields)
        }))
    }

    /// Integer coercion of declared fields, soft-delete stripping and the
    /// type's `after_read` hook.
    pub fn normalize(&self, detail: &mut Detail) {
        for field in self.descriptor.int_fields() {
            if let Some(value) = detail.get_mut(field) {
                if let Some(coerced) = coerce_int(value) {
                    *value = coerced;
                }
            }
        }
        if let Some(field) = self.descriptor.soft_delete_field() {
            detail.remove(field);
        }
        self.descriptor.hooks().after_read(detail);
    }

    // == Rebuild ==

    /// Miss path: stops at a tombstone, otherwise rebuilds under the stampede
    /// lock after re-checking the store. Fails with [`CacheError::Busy`] when
    /// the lock cannot be acquired in time.
    pub async fn get_detail_where_no_cache(&mut self) -> Result<Option<Detail>> {
        if self.has_tombstone().await? {
            self.ctx.recorder().record_tombstone_hit();
            debug!(key = %self.cache_key, "tombstone present, source not queried");
            return Ok(None);
        }

        let ctx = Arc::clone(&self.ctx);
        let pool = self.pool.clone();
        let key = self.cache_key.clone();
        let config = ctx.config();
        ctx.lock()
            .with_lock(&pool, &key, config.lock_ttl, config.lock_tries, move || {
                let entry = self;
                entry.rebuild_if_missing()
            })
            .await
    }

    /// Lock body: another holder may already have rebuilt the entry.
    async fn rebuild_if_missing(&mut self) -> Result<Option<Detail>> {
        if let Some(current) = self.read_cache(&[]).await? {
            self.detail = Some(current.clone());
            return Ok(Some(current));
        }
        if self.has_tombstone().await? {
            self.ctx.recorder().record_tombstone_hit();
            return Ok(None);
        }
        self.build_cache().await
    }

    /// Replaces the entry with the source's current state.
    ///
    /// Absence, and an empty record, are recorded as a tombstone. Returns the
    /// persisted detail.
    pub async fn build_cache(&mut self) -> Result<Option<Detail>> {
        if !self.has_pk() {
            return Ok(None);
        }

        self.clear_cache().await?;

        self.ctx.recorder().record_source_load();
        let record = self
            .descriptor
            .source()
            .load_current(&self.pk)
            .await
            .map_err(CacheError::Source)?;

        let detail = match record {
            Some(record) => record_to_detail(record)?,
            None => Detail::new(),
        };
        if detail.is_empty() {
            self.write_tombstone().await?;
            info!(key = %self.cache_key, "source reports absence, tombstone written");
            return Ok(None);
        }

        self.ctx.recorder().record_rebuild();
        info!(key = %self.cache_key, "cache rebuilt from source");
        self.detail = Some(detail);
        self.save_cache(false).await?;
        Ok(self.detail.clone().map(|detail| self.stored_form(detail)))
    }

    /// `detail` as a read of the freshly written entry returns it.
    fn stored_form(&self, detail: Detail) -> Detail {
        match self.descriptor.mode() {
            StorageMode::Blob => detail,
            StorageMode::FieldMap => encode_fields(&detail)
                .into_iter()
                .map(|(field, value)| (field, Value::String(value)))
                .collect(),
        }
    }

    // == Writes ==

    /// Replaces the entry with a caller-supplied record.
    pub async fn set_detail(&mut self, record: Value) -> Result<()> {
        if !self.has_pk() {
            return Ok(());
        }
        self.detail = Some(record_to_detail(record)?);
        self.save_cache(true).await
    }

    /// Persists the mirror: `before_save` hook, tombstone removal, write,
    /// jittered TTL, `after_save` hook. `replace` drops stale hash fields first.
    async fn save_cache(&mut self, replace: bool) -> Result<()> {
        let Some(mut detail) = self.detail.take() else {
            return Ok(());
        };
        if detail.is_empty() {
            return Ok(());
        }

        self.descriptor.hooks().before_save(&mut detail);
        self.remove_tombstone().await?;

        match self.descriptor.mode() {
            StorageMode::Blob => {
                let raw = serde_json::to_string(&detail)?;
                self.store.set(&self.cache_key, &raw).await?;
            }
            StorageMode::FieldMap => {
                if replace {
                    self.store.del(&self.cache_key).await?;
                }
                self.store
                    .hmset(&self.cache_key, &encode_fields(&detail))
                    .await?;
            }
        }
        self.refresh_ttl().await?;

        self.after_save(&detail).await;
        self.detail = Some(detail);
        Ok(())
    }

    /// Applies `base + rand(0..=jitter)`. A base TTL of 0 leaves the entry
    /// persistent.
    async fn refresh_ttl(&self) -> Result<()> {
        if let Some(ttl) = self.next_ttl() {
            self.store.expire(&self.cache_key, ttl).await?;
        }
        Ok(())
    }

    /// Fresh jittered TTL, `None` for persistent entries.
    fn next_ttl(&self) -> Option<u64> {
        let config = self.ctx.config();
        let base = self.descriptor.ttl().unwrap_or(config.default_ttl);
        (base != 0).then(|| jittered_ttl(base, config.ttl_jitter))
    }

    /// Overwrites one field that already exists in the detail.
    ///
    /// Returns false, writing nothing, when the field is absent. Blob entries
    /// are read-modified-written under the entry's lock so concurrent field
    /// updates do not overwrite each other.
    pub async fn update_field_cache(&mut self, field: &str, value: Value) -> Result<bool> {
        if !self.has_pk() {
            return Ok(false);
        }

        let detail = self.get_detail(&[]).await?;
        if !is_set(&detail, field) {
            return Ok(false);
        }

        let mut changed = Detail::new();
        changed.insert(field.to_string(), value.clone());

        match self.descriptor.mode() {
            StorageMode::FieldMap => {
                self.store
                    .hset(&self.cache_key, field, &encode_field(&value))
                    .await?;
                self.refresh_ttl().await?;
            }
            StorageMode::Blob => {
                if !self.merge_blob_locked(changed.clone()).await? {
                    return Ok(false);
                }
            }
        }

        let mut mirror = detail;
        mirror.insert(field.to_string(), value);
        self.detail = Some(mirror);

        self.after_save(&changed).await;
        Ok(true)
    }

    /// Overwrites several fields. Fields absent from the current detail are
    /// dropped; returns false when nothing is left to write.
    pub async fn update_mul_field_cache(&mut self, fields: Detail) -> Result<bool> {
        if !self.has_pk() {
            return Ok(false);
        }

        let mut detail = self.get_detail(&[]).await?;
        if detail.is_empty() {
            return Ok(false);
        }

        let changes: Detail = fields
            .into_iter()
            .filter(|(field, _)| is_set(&detail, field))
            .collect();
        if changes.is_empty() {
            return Ok(false);
        }
        for (field, value) in &changes {
            detail.insert(field.clone(), value.clone());
        }

        match self.descriptor.mode() {
            StorageMode::FieldMap => {
                self.detail = Some(detail);
                self.save_cache(false).await?;
            }
            StorageMode::Blob => {
                if !self.merge_blob_locked(changes).await? {
                    return Ok(false);
                }
                self.after_save(&detail).await;
                self.detail = Some(detail);
            }
        }
        Ok(true)
    }

    /// Merges `changes` into the stored blob, TTL refreshed, while holding
    /// the entry's lock. Returns false if the blob vanished in the meantime.
    async fn merge_blob_locked(&self, changes: Detail) -> Result<bool> {
        let config = self.ctx.config();
        let target = BlobTarget {
            store: Arc::clone(&self.store),
            key: self.cache_key.clone(),
            ttl: self.next_ttl(),
        };
        let hooks = Arc::clone(self.descriptor.hooks());

        self.ctx
            .lock()
            .with_lock(&self.pool, &self.cache_key, config.lock_ttl, config.lock_tries, move || {
                merge_blob(target, changes, hooks)
            })
            .await
    }

    // == Increments ==

    /// Adds `delta` to an integer field.
    ///
    /// `None` when the field is absent. When no entry is cached yet the entry
    /// is rebuilt from the source and the rebuilt value returned as-is.
    pub async fn incr(&mut self, field: &str, delta: i64) -> Result<Option<i64>> {
        Ok(self
            .increment(field, Delta::Int(delta))
            .await?
            .as_ref()
            .and_then(coerce_int)
            .and_then(|v| v.as_i64()))
    }

    /// Adds `delta` to a float field. Same contract as [`incr`](Self::incr).
    pub async fn incr_by_float(&mut self, field: &str, delta: f64) -> Result<Option<f64>> {
        Ok(self
            .increment(field, Delta::Float(delta))
            .await?
            .as_ref()
            .and_then(as_f64))
    }

    async fn increment(&mut self, field: &str, delta: Delta) -> Result<Option<Value>> {
        if !self.has_pk() {
            return Ok(None);
        }

        if !self.store.exists(&self.cache_key).await? {
            let built = self.build_cache().await?;
            return Ok(built.and_then(|detail| detail.get(field).cloned()));
        }

        let next = match self.descriptor.mode() {
            StorageMode::FieldMap => {
                let current = self
                    .store
                    .hmget(&self.cache_key, &[field.to_string()])
                    .await?;
                if !matches!(current.first(), Some(Some(_))) {
                    return Ok(None);
                }
                let next = match delta {
                    Delta::Int(d) => Value::from(self.store.hincr_by(&self.cache_key, field, d).await?),
                    Delta::Float(d) => {
                        float_value(self.store.hincr_by_float(&self.cache_key, field, d).await?)?
                    }
                };
                self.refresh_ttl().await?;
                next
            }
            StorageMode::Blob => match self.increment_blob_locked(field, delta).await? {
                Some(next) => next,
                None => return Ok(None),
            },
        };

        if let Some(mirror) = self.detail.as_mut() {
            mirror.insert(field.to_string(), next.clone());
        }

        let mut changed = Detail::new();
        changed.insert(field.to_string(), next.clone());
        self.after_save(&changed).await;
        Ok(Some(next))
    }

    async fn increment_blob_locked(&self, field: &str, delta: Delta) -> Result<Option<Value>> {
        let config = self.ctx.config();
        let target = BlobTarget {
            store: Arc::clone(&self.store),
            key: self.cache_key.clone(),
            ttl: self.next_ttl(),
        };
        let field = field.to_string();

        self.ctx
            .lock()
            .with_lock(&self.pool, &self.cache_key, config.lock_ttl, config.lock_tries, move || {
                increment_blob(target, field, delta)
            })
            .await
    }

    // == Deletion ==

    /// Deletes the store entry and forgets the mirror. The tombstone is kept.
    /// Returns the number of keys removed.
    pub async fn clear_cache(&mut self) -> Result<u64> {
        if !self.has_pk() {
            return Ok(0);
        }
        self.detail = None;
        self.store.del(&self.cache_key).await
    }

    /// [`clear_cache`](Self::clear_cache) followed by the `on_delete` hook.
    pub async fn del_cache(&mut self) -> Result<u64> {
        if !self.has_pk() {
            return Ok(0);
        }
        let removed = self.clear_cache().await?;
        if let Err(err) = self.descriptor.hooks().on_delete(&self.pk).await {
            warn!(key = %self.cache_key, error = %err, "delete hook failed");
        }
        Ok(removed)
    }

    // == Tombstones ==

    pub async fn has_tombstone(&self) -> Result<bool> {
        self.store.exists(&self.tombstone_key()).await
    }

    pub async fn remove_tombstone(&self) -> Result<u64> {
        self.store.del(&self.tombstone_key()).await
    }

    async fn write_tombstone(&self) -> Result<()> {
        let config = self.ctx.config();
        let ttl = jittered_ttl(config.tombstone_ttl, config.ttl_jitter);
        self.store.set_ex(&self.tombstone_key(), "1", ttl).await?;
        self.ctx.recorder().record_tombstone_written();
        Ok(())
    }

    // == Related Adapters ==

    /// Collection adapter of type `A` bound to this entry's pool and pk,
    /// created on first request and reused afterwards.
    pub fn related<A: RelatedAdapter>(&mut self) -> Arc<A> {
        let type_id = TypeId::of::<A>();
        if let Some(existing) = self.related.get(&type_id) {
            if let Ok(adapter) = Arc::clone(existing).downcast::<A>() {
                return adapter;
            }
        }
        let adapter = Arc::new(A::bind(Arc::clone(&self.store), &self.pool, &self.pk));
        self.related.insert(type_id, adapter.clone());
        adapter
    }

    async fn after_save(&self, changed: &Detail) {
        if let Err(err) = self.descriptor.hooks().after_save(&self.pk, changed).await {
            warn!(key = %self.cache_key, error = %err, "save hook failed");
        }
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("pool", &self.pool)
            .field("cache_key", &self.cache_key)
            .field("detail", &self.detail)
            .finish_non_exhaustive()
    }
}

// == Locked Blob Bodies ==
// Both run while the entry's lock is held.

/// Blob key rewritten under the lock, with the TTL it is written with.
struct BlobTarget {
    store: Arc<dyn StoreGateway>,
    key: String,
    ttl: Option<u64>,
}

impl BlobTarget {
    async fn read(&self) -> Result<Option<Detail>> {
        Ok(self.store.get(&self.key).await?.map(|raw| decode_blob(&raw)))
    }

    /// Writes value and expiry in one command.
    async fn write(&self, detail: &Detail) -> Result<()> {
        let raw = serde_json::to_string(detail)?;
        match self.ttl {
            Some(ttl) => self.store.set_ex(&self.key, &raw, ttl).await,
            None => self.store.set(&self.key, &raw).await,
        }
    }
}

async fn merge_blob(
    target: BlobTarget,
    changes: Detail,
    hooks: Arc<dyn EntityHooks>,
) -> Result<bool> {
    let mut current = target.read().await?.unwrap_or_default();
    if current.is_empty() {
        return Ok(false);
    }
    current.extend(changes);
    hooks.before_save(&mut current);
    target.write(&current).await?;
    Ok(true)
}

async fn increment_blob(target: BlobTarget, field: String, delta: Delta) -> Result<Option<Value>> {
    let Some(mut current) = target.read().await? else {
        return Ok(None);
    };
    let Some(old) = current.get(&field).filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let next = match delta {
        Delta::Int(d) => {
            let base = coerce_int(old).and_then(|v| v.as_i64()).unwrap_or(0);
            Value::from(base.checked_add(d).ok_or_else(CacheError::overflow)?)
        }
        Delta::Float(d) => float_value(as_f64(old).unwrap_or(0.0) + d)?,
    };
    current.insert(field, next.clone());
    target.write(&current).await?;
    Ok(Some(next))
}

/// `fields` with the primary-key field prepended when missing.
pub(crate) fn with_pk_field(fields: &[String], pk_field: &str) -> Vec<String> {
    if fields.iter().any(|f| f == pk_field) {
        return fields.to_vec();
    }
    let mut wanted = Vec::with_capacity(fields.len() + 1);
    wanted.push(pk_field.to_string());
    wanted.extend_from_slice(fields);
    wanted
}

/// Zips an `hmget` reply with its field list, keeping the set fields.
pub(crate) fn hash_fields_to_detail(fields: &[String], values: Vec<Option<String>>) -> Detail {
    fields
        .iter()
        .zip(values)
        .filter_map(|(field, value)| value.map(|v| (field.clone(), Value::String(v))))
        .collect()
}

/// Present and not null.
fn is_set(detail: &Detail, field: &str) -> bool {
    detail.get(field).is_some_and(|v| !v.is_null())
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn float_value(value: f64) -> Result<Value> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| CacheError::InvalidRecord(format!("non-finite increment result {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::entity::{EntityHooks, MapSource};
    use crate::store::{MemoryStore, StoreRegistry};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        ctx: Arc<CacheContext>,
        store: Arc<MemoryStore>,
        source: Arc<MapSource>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let config = CacheConfig {
            lock_retry_ms: 5,
            ..CacheConfig::default()
        };
        let ctx = CacheContext::new(config, StoreRegistry::single(store.clone()));
        let source = Arc::new(MapSource::new());
        source.insert("42", json!({"id": 42, "sort": 3, "status": "1", "deleted_at": "2020"}));
        Fixture { ctx, store, source }
    }

    async fn entry(fx: &Fixture, mode: StorageMode, pk: &str) -> CacheEntry {
        let descriptor = EntityDescriptor::builder("widget", fx.source.clone())
            .mode(mode)
            .int_field("id")
            .build()
            .unwrap();
        CacheEntry::new(fx.ctx.clone(), descriptor, pk).await.unwrap()
    }

    #[tokio::test]
    async fn test_get_detail_normalizes_both_modes() {
        for mode in [StorageMode::Blob, StorageMode::FieldMap] {
            let fx = fixture();
            let mut widget = entry(&fx, mode, "42").await;

            let detail = widget.get_detail(&[]).await.unwrap();

            assert_eq!(Value::Object(detail), json!({"id": 42, "sort": 3, "status": 1}));
            assert_eq!(fx.source.loads(), 1);
        }
    }

    #[tokio::test]
    async fn test_second_read_is_a_hit() {
        let fx = fixture();
        let mut widget = entry(&fx, StorageMode::FieldMap, "42").await;
        widget.get_detail(&[]).await.unwrap();

        let mut again = entry(&fx, StorageMode::FieldMap, "42").await;
        again.get_detail(&[]).await.unwrap();

        assert_eq!(fx.source.loads(), 1);
        let stats = fx.ctx.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn test_get_columns() {
        let fx = fixture();
        let mut widget = entry(&fx, StorageMode::FieldMap, "42").await;

        let columns = widget
            .get_columns(&["sort".to_string(), "status".to_string()])
            .await
            .unwrap();
        assert_eq!(columns.map(Value::Object), Some(json!({"sort": 3, "status": 1})));

        let unset = widget.get_columns(&["ghost".to_string()]).await.unwrap();
        assert_eq!(unset, None);

        let mut missing = entry(&fx, StorageMode::FieldMap, "404").await;
        assert_eq!(missing.get_columns(&[]).await.unwrap(), None);
        let mut no_pk = entry(&fx, StorageMode::FieldMap, "").await;
        assert_eq!(no_pk.get_columns(&[]).await.unwrap(), None);
        assert_eq!(fx.source.loads(), 2);
    }

    #[tokio::test]
    async fn test_projection() {
        let fx = fixture();
        let mut widget = entry(&fx, StorageMode::FieldMap, "42").await;

        let detail = widget
            .get_detail(&["sort".to_string(), "ghost".to_string()])
            .await
            .unwrap();

        assert_eq!(Value::Object(detail), json!({"sort": 3}));
    }

    #[tokio::test]
    async fn test_unset_fields_of_present_entity_are_not_a_miss() {
        let fx = fixture();
        let mut widget = entry(&fx, StorageMode::FieldMap, "42").await;
        widget.get_detail(&[]).await.unwrap();

        let detail = widget.get_detail(&["ghost".to_string()]).await.unwrap();

        assert!(detail.is_empty());
        assert_eq!(fx.source.loads(), 1);
        assert_eq!(fx.ctx.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_empty_pk_yields_nothing() {
        let fx = fixture();
        let mut widget = entry(&fx, StorageMode::Blob, "").await;

        assert!(widget.get_detail(&[]).await.unwrap().is_empty());
        assert!(!widget.exists().await.unwrap());
        assert_eq!(widget.clear_cache().await.unwrap(), 0);
        assert_eq!(fx.source.loads(), 0);
    }

    #[tokio::test]
    async fn test_empty_pk_allowed_for_singletons() {
        let fx = fixture();
        fx.source.insert("", json!({"motd": "hello"}));
        let descriptor = EntityDescriptor::builder("settings", fx.source.clone())
            .allow_empty_pk(true)
            .build()
            .unwrap();
        let mut settings = CacheEntry::new(fx.ctx.clone(), descriptor, "").await.unwrap();

        assert_eq!(
            settings.get_field("motd").await.unwrap(),
            Some(json!("hello"))
        );
        assert!(fx.store.exists("settings").await.unwrap());
    }

    #[tokio::test]
    async fn test_absent_entity_writes_tombstone() {
        let fx = fixture();
        let mut widget = entry(&fx, StorageMode::FieldMap, "7").await;

        assert!(widget.get_detail_where_no_cache().await.unwrap().is_none());
        assert!(widget.has_tombstone().await.unwrap());
        let ttl = fx.store.ttl("widget:7.null").await.unwrap();
        assert!((60..=70).contains(&ttl), "tombstone ttl {}", ttl);

        assert!(widget.is_empty().await.unwrap());
        assert_eq!(fx.source.loads(), 1);
    }

    #[tokio::test]
    async fn test_save_removes_tombstone() {
        let fx = fixture();
        let mut widget = entry(&fx, StorageMode::FieldMap, "7").await;
        widget.build_cache().await.unwrap();
        assert!(widget.has_tombstone().await.unwrap());

        widget.set_detail(json!({"id": 7, "name": "late"})).await.unwrap();

        assert!(!widget.has_tombstone().await.unwrap());
        assert!(widget.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_build_cache_sets_jittered_ttl() {
        let fx = fixture();
        let mut widget = entry(&fx, StorageMode::Blob, "42").await;
        widget.build_cache().await.unwrap();

        let base = CacheConfig::default().default_ttl as i64;
        let ttl = fx.store.ttl("widget:42").await.unwrap();
        assert!((base..=base + 10).contains(&ttl));
    }

    #[tokio::test]
    async fn test_build_cache_replaces_rather_than_merges() {
        let fx = fixture();
        fx.store.hset("widget:42", "stale", "x").await.unwrap();
        let mut widget = entry(&fx, StorageMode::FieldMap, "42").await;

        widget.build_cache().await.unwrap();

        let hash = fx.store.hget_all("widget:42").await.unwrap();
        assert!(!hash.contains_key("stale"));
    }

    #[tokio::test]
    async fn test_empty_record_is_tombstoned() {
        for mode in [StorageMode::Blob, StorageMode::FieldMap] {
            let fx = fixture();
            fx.source.insert("9", json!({}));

            for _ in 0..5 {
                let mut widget = entry(&fx, mode, "9").await;
                assert!(widget.get_detail(&[]).await.unwrap().is_empty());
            }

            let widget = entry(&fx, mode, "9").await;
            assert!(!widget.exists().await.unwrap());
            assert!(widget.has_tombstone().await.unwrap());
            let ttl = fx.store.ttl("widget:9.null").await.unwrap();
            assert!((60..=70).contains(&ttl), "tombstone ttl {}", ttl);
            assert_eq!(fx.source.loads(), 1);
        }
    }

    #[tokio::test]
    async fn test_rebuilt_detail_matches_cached_read() {
        for mode in [StorageMode::Blob, StorageMode::FieldMap] {
            let fx = fixture();
            fx.source.insert("8", json!({"id": 8, "weight": 12, "label": "x"}));

            let mut first = entry(&fx, mode, "8").await;
            let rebuilt = first.get_detail(&[]).await.unwrap();
            let mut second = entry(&fx, mode, "8").await;
            let cached = second.get_detail(&[]).await.unwrap();

            assert_eq!(rebuilt, cached);
            assert_eq!(fx.source.loads(), 1);
        }
    }

    #[tokio::test]
    async fn test_set_detail_replaces_hash() {
        let fx = fixture();
        let mut widget = entry(&fx, StorageMode::FieldMap, "42").await;
        widget.get_detail(&[]).await.unwrap();

        widget.set_detail(json!({"id": 42, "name": "fresh"})).await.unwrap();

        let hash = fx.store.hget_all("widget:42").await.unwrap();
        assert_eq!(hash.len(), 2);
        assert_eq!(hash.get("name").map(String::as_str), Some("fresh"));
    }

    #[tokio::test]
    async fn test_update_field_missing_leaves_store_untouched() {
        for mode in [StorageMode::Blob, StorageMode::FieldMap] {
            let fx = fixture();
            let mut widget = entry(&fx, mode, "42").await;
            widget.get_detail(&[]).await.unwrap();
            let before = match mode {
                StorageMode::Blob => format!("{:?}", fx.store.get("widget:42").await.unwrap()),
                StorageMode::FieldMap => {
                    let mut pairs: Vec<_> = fx.store.hget_all("widget:42").await.unwrap().into_iter().collect();
                    pairs.sort();
                    format!("{:?}", pairs)
                }
            };

            assert!(!widget.update_field_cache("ghost", json!(1)).await.unwrap());

            let after = match mode {
                StorageMode::Blob => format!("{:?}", fx.store.get("widget:42").await.unwrap()),
                StorageMode::FieldMap => {
                    let mut pairs: Vec<_> = fx.store.hget_all("widget:42").await.unwrap().into_iter().collect();
                    pairs.sort();
                    format!("{:?}", pairs)
                }
            };
            assert_eq!(before, after);
        }
    }

    #[tokio::test]
    async fn test_update_field_then_read() {
        for mode in [StorageMode::Blob, StorageMode::FieldMap] {
            let fx = fixture();
            let mut widget = entry(&fx, mode, "42").await;
            widget.get_detail(&[]).await.unwrap();

            assert!(widget.update_field_cache("sort", json!(9)).await.unwrap());

            let mut reader = entry(&fx, mode, "42").await;
            assert_eq!(reader.get_field("sort").await.unwrap(), Some(json!(9)));
            assert_eq!(widget.mirror().unwrap().get("sort"), Some(&json!(9)));
        }
    }

    #[tokio::test]
    async fn test_update_field_refreshes_ttl() {
        let fx = fixture();
        let mut widget = entry(&fx, StorageMode::Blob, "42").await;
        widget.get_detail(&[]).await.unwrap();
        fx.store.expire("widget:42", 30).await.unwrap();

        widget.update_field_cache("sort", json!(1)).await.unwrap();

        let base = CacheConfig::default().default_ttl as i64;
        assert!(fx.store.ttl("widget:42").await.unwrap() >= base);
    }

    #[tokio::test]
    async fn test_blob_field_updates_do_not_lose_writes() {
        let fx = fixture();
        fx.source.insert("5", json!({"id": 5, "a": 0, "b": 0}));
        entry(&fx, StorageMode::Blob, "5").await.get_detail(&[]).await.unwrap();

        let mut first = entry(&fx, StorageMode::Blob, "5").await;
        let mut second = entry(&fx, StorageMode::Blob, "5").await;
        first.get_detail(&[]).await.unwrap();
        second.get_detail(&[]).await.unwrap();

        let (a, b) = tokio::join!(
            first.update_field_cache("a", json!(1)),
            second.update_field_cache("b", json!(2)),
        );
        assert!(a.unwrap() && b.unwrap());

        let stored = decode_blob(&fx.store.get("widget:5").await.unwrap().unwrap());
        assert_eq!(stored.get("a"), Some(&json!(1)));
        assert_eq!(stored.get("b"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_locked_blob_rewrite_keeps_an_expiry() {
        let fx = fixture();
        fx.store.set("widget:6", r#"{"id":6,"hits":1,"name":"a"}"#).await.unwrap();
        let target = |ttl| BlobTarget {
            store: fx.store.clone(),
            key: "widget:6".to_string(),
            ttl,
        };

        let mut changes = Detail::new();
        changes.insert("name".to_string(), json!("b"));
        let hooks: Arc<dyn EntityHooks> = Arc::new(crate::entity::NoHooks);
        assert!(merge_blob(target(Some(120)), changes, hooks).await.unwrap());
        let ttl = fx.store.ttl("widget:6").await.unwrap();
        assert!((119..=120).contains(&ttl));

        let next = increment_blob(target(Some(90)), "hits".to_string(), Delta::Int(2))
            .await
            .unwrap();
        assert_eq!(next, Some(json!(3)));
        let ttl = fx.store.ttl("widget:6").await.unwrap();
        assert!((89..=90).contains(&ttl));

        increment_blob(target(None), "hits".to_string(), Delta::Int(1))
            .await
            .unwrap();
        assert_eq!(fx.store.ttl("widget:6").await.unwrap(), crate::store::TTL_PERSISTENT);
    }

    #[tokio::test]
    async fn test_update_mul_field_cache_filters_unknown_fields() {
        let fx = fixture();
        let mut widget = entry(&fx, StorageMode::FieldMap, "42").await;

        let mut only_unknown = Detail::new();
        only_unknown.insert("ghost".to_string(), json!(1));
        assert!(!widget.update_mul_field_cache(only_unknown).await.unwrap());

        let mut changes = Detail::new();
        changes.insert("sort".to_string(), json!(8));
        changes.insert("ghost".to_string(), json!(1));
        assert!(widget.update_mul_field_cache(changes).await.unwrap());

        let hash = fx.store.hget_all("widget:42").await.unwrap();
        assert_eq!(hash.get("sort").map(String::as_str), Some("8"));
        assert!(!hash.contains_key("ghost"));
    }

    #[tokio::test]
    async fn test_update_mul_field_cache_blob() {
        let fx = fixture();
        let mut widget = entry(&fx, StorageMode::Blob, "42").await;

        let mut changes = Detail::new();
        changes.insert("status".to_string(), json!(0));
        assert!(widget.update_mul_field_cache(changes).await.unwrap());

        let mut reader = entry(&fx, StorageMode::Blob, "42").await;
        assert_eq!(reader.get_field("status").await.unwrap(), Some(json!(0)));
    }

    #[tokio::test]
    async fn test_update_on_missing_entity_fails() {
        let fx = fixture();
        let mut widget = entry(&fx, StorageMode::FieldMap, "404").await;
        assert!(!widget.update_field_cache("sort", json!(1)).await.unwrap());
        assert!(!widget.update_mul_field_cache(Detail::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_field_map() {
        let fx = fixture();
        let mut widget = entry(&fx, StorageMode::FieldMap, "42").await;
        widget.get_detail(&[]).await.unwrap();

        assert_eq!(widget.incr("sort", 2).await.unwrap(), Some(5));
        assert_eq!(widget.incr("ghost", 1).await.unwrap(), None);
        assert!(!fx.store.hget_all("widget:42").await.unwrap().contains_key("ghost"));
    }

    #[tokio::test]
    async fn test_incr_blob_and_float() {
        let fx = fixture();
        fx.source.insert("3", json!({"id": 3, "views": 10, "score": 1.5}));
        let mut widget = entry(&fx, StorageMode::Blob, "3").await;
        widget.get_detail(&[]).await.unwrap();

        assert_eq!(widget.incr("views", 5).await.unwrap(), Some(15));
        assert_eq!(widget.incr_by_float("score", 1.0).await.unwrap(), Some(2.5));
        assert_eq!(widget.incr("ghost", 5).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_by_float_field_map() {
        let fx = fixture();
        fx.source.insert("3", json!({"id": 3, "score": 1.5}));
        let mut widget = entry(&fx, StorageMode::FieldMap, "3").await;
        widget.get_detail(&[]).await.unwrap();

        assert_eq!(widget.incr_by_float("score", 1.0).await.unwrap(), Some(2.5));
        assert_eq!(widget.incr_by_float("ghost", 1.0).await.unwrap(), None);

        let hash = fx.store.hget_all("widget:3").await.unwrap();
        assert_eq!(hash.get("score").map(String::as_str), Some("2.5"));
        assert!(!hash.contains_key("ghost"));
        assert_eq!(widget.mirror().unwrap().get("score"), Some(&json!(2.5)));
    }

    #[tokio::test]
    async fn test_incr_overflow_is_an_error() {
        for mode in [StorageMode::Blob, StorageMode::FieldMap] {
            let fx = fixture();
            fx.source.insert("1", json!({"id": 1, "views": i64::MAX}));
            let mut widget = entry(&fx, mode, "1").await;
            widget.get_detail(&[]).await.unwrap();

            let err = widget.incr("views", 1).await.unwrap_err();

            assert!(matches!(&err, CacheError::Store(msg) if msg.contains("overflow")), "{}", err);
            assert!(!fx.store.exists("widget:1.lock").await.unwrap());
            let mut reader = entry(&fx, mode, "1").await;
            let views = reader.get_field("views").await.unwrap().as_ref().and_then(coerce_int);
            assert_eq!(views, Some(json!(i64::MAX)));
        }
    }

    #[tokio::test]
    async fn test_incr_without_entry_rebuilds() {
        let fx = fixture();
        let mut widget = entry(&fx, StorageMode::FieldMap, "42").await;

        assert_eq!(widget.incr("sort", 100).await.unwrap(), Some(3));
        assert!(widget.exists().await.unwrap());
        assert_eq!(fx.source.loads(), 1);
    }

    #[tokio::test]
    async fn test_clear_cache_is_idempotent() {
        let fx = fixture();
        let mut widget = entry(&fx, StorageMode::FieldMap, "42").await;
        widget.get_detail(&[]).await.unwrap();

        assert_eq!(widget.clear_cache().await.unwrap(), 1);
        assert_eq!(widget.clear_cache().await.unwrap(), 0);
        assert_eq!(widget.clear_cache().await.unwrap(), 0);
        assert!(widget.mirror().is_none());
    }

    #[tokio::test]
    async fn test_clear_cache_keeps_tombstone() {
        let fx = fixture();
        let mut widget = entry(&fx, StorageMode::FieldMap, "404").await;
        widget.get_detail(&[]).await.unwrap();

        widget.clear_cache().await.unwrap();

        assert!(widget.has_tombstone().await.unwrap());
    }

    #[derive(Default)]
    struct CountingHooks {
        saves: AtomicUsize,
        deletes: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EntityHooks for CountingHooks {
        fn before_save(&self, detail: &mut Detail) {
            detail.insert("cached".to_string(), json!(true));
        }

        fn after_read(&self, detail: &mut Detail) {
            detail.remove("secret");
        }

        async fn after_save(&self, _pk: &str, _changed: &Detail) -> anyhow::Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_delete(&self, _pk: &str) -> anyhow::Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("search index unreachable")
        }
    }

    #[tokio::test]
    async fn test_hooks_run_on_persist_read_and_delete() {
        let fx = fixture();
        fx.source.insert("1", json!({"id": 1, "secret": "s"}));
        let hooks = Arc::new(CountingHooks::default());
        let descriptor = EntityDescriptor::builder("widget", fx.source.clone())
            .mode(StorageMode::Blob)
            .hooks(hooks.clone())
            .build()
            .unwrap();
        let mut widget = CacheEntry::new(fx.ctx.clone(), descriptor, "1").await.unwrap();

        let detail = widget.get_detail(&[]).await.unwrap();
        assert_eq!(detail.get("cached"), Some(&json!(true)));
        assert!(detail.get("secret").is_none());
        assert_eq!(hooks.saves.load(Ordering::SeqCst), 1);

        // A failing delete hook does not fail the delete
        assert_eq!(widget.del_cache().await.unwrap(), 1);
        assert_eq!(hooks.deletes.load(Ordering::SeqCst), 1);
        assert!(!widget.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_busy_lock_surfaces_as_error() {
        let store = Arc::new(MemoryStore::new());
        let config = CacheConfig {
            lock_tries: 2,
            lock_retry_ms: 5,
            ..CacheConfig::default()
        };
        let ctx = CacheContext::new(config, StoreRegistry::single(store.clone()));
        let source = Arc::new(MapSource::new());
        source.insert("1", json!({"id": 1}));
        let descriptor = EntityDescriptor::builder("widget", source.clone()).build().unwrap();
        store.set_ex("widget:1.lock", "1", 5).await.unwrap();

        let mut widget = CacheEntry::new(ctx, descriptor, "1").await.unwrap();
        let err = widget.get_detail(&[]).await.unwrap_err();

        assert!(err.is_busy());
        assert_eq!(source.loads(), 0);
    }

    struct FailingSource;

    #[async_trait::async_trait]
    impl crate::entity::DataSource for FailingSource {
        async fn load_current(&self, _pk: &str) -> anyhow::Result<Option<Value>> {
            anyhow::bail!("database down")
        }
    }

    #[tokio::test]
    async fn test_source_failure_releases_lock() {
        let fx = fixture();
        let descriptor = EntityDescriptor::builder("widget", Arc::new(FailingSource))
            .build()
            .unwrap();
        let mut widget = CacheEntry::new(fx.ctx.clone(), descriptor, "1").await.unwrap();

        let err = widget.get_detail(&[]).await.unwrap_err();

        assert!(matches!(err, CacheError::Source(_)));
        assert!(!fx.store.exists("widget:1.lock").await.unwrap());
        assert!(!widget.has_tombstone().await.unwrap());
    }

    struct Tags(crate::entity::SetCache);

    impl RelatedAdapter for Tags {
        fn bind(store: Arc<dyn StoreGateway>, _pool: &str, pk: &str) -> Self {
            Tags(crate::entity::SetCache::new(store, format!("widget_tags:{}", pk)))
        }
    }

    #[tokio::test]
    async fn test_related_adapter_is_memoized() {
        let fx = fixture();
        let mut widget = entry(&fx, StorageMode::FieldMap, "42").await;

        let tags = widget.related::<Tags>();
        tags.0.add("blue").await.unwrap();
        let again = widget.related::<Tags>();

        assert!(Arc::ptr_eq(&tags, &again));
        assert!(fx.store.sismember("widget_tags:42", "blue").await.unwrap());
    }
}
