//! Batch Fetch Reconciler
//!
//! Loads many entities of one type with a single pipelined round trip to the
//! store. Misses fall back, one by one, to the stampede-safe single-entry
//! rebuild path.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::context::CacheContext;
use crate::entity::{
    decode_blob, decode_hash, encode_field, hash_fields_to_detail, project, with_pk_field,
    CacheEntry, Detail, EntityDescriptor, StorageMode,
};
use crate::error::Result;
use crate::store::{ReadOp, ReadReply};

// == Batch Result ==
/// Records resolved by [`get_many`], in id order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BatchResult {
    /// Plain list of records
    Ordered(Vec<Detail>),
    /// Records by the value of the requested key field, in first-seen order.
    /// A later record with the same key replaces the earlier one.
    Keyed(IndexMap<String, Detail>),
}

impl BatchResult {
    pub fn len(&self) -> usize {
        match self {
            BatchResult::Ordered(items) => items.len(),
            BatchResult::Keyed(items) => items.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record keyed by `key`. Always `None` for an ordered result.
    pub fn get(&self, key: &str) -> Option<&Detail> {
        match self {
            BatchResult::Ordered(_) => None,
            BatchResult::Keyed(items) => items.get(key),
        }
    }

    pub fn into_details(self) -> Vec<Detail> {
        match self {
            BatchResult::Ordered(items) => items,
            BatchResult::Keyed(items) => items.into_values().collect(),
        }
    }
}

// == Get Many ==
/// Fetches `ids` from `pool`, skipping ids that resolve to nothing.
///
/// A non-empty `fields` projection always gains the type's primary-key field
/// so a missing entity can be told from one whose requested fields are unset.
/// The result is keyed by `key_field` when it is given, was retrieved, and
/// every resolved record carries it; otherwise it is ordered.
pub async fn get_many<S: AsRef<str>>(
    ctx: &Arc<CacheContext>,
    descriptor: &Arc<EntityDescriptor>,
    pool: &str,
    ids: &[S],
    fields: &[String],
    key_field: Option<&str>,
) -> Result<BatchResult> {
    if ids.is_empty() {
        return Ok(BatchResult::Ordered(Vec::new()));
    }

    let projection = if fields.is_empty() {
        Vec::new()
    } else {
        with_pk_field(fields, descriptor.pk_field())
    };

    let mut entries = Vec::with_capacity(ids.len());
    for id in ids {
        let entry =
            CacheEntry::in_pool(Arc::clone(ctx), Arc::clone(descriptor), pool, id.as_ref()).await?;
        if entry.has_pk() {
            entries.push(entry);
        }
    }

    let ops: Vec<ReadOp> = entries
        .iter()
        .map(|entry| read_op(entry, &projection))
        .collect();
    let store = ctx.registry().store(pool).await?;
    let replies = store.pipeline(&ops).await?;

    let mut resolved = Vec::with_capacity(entries.len());
    let mut fallbacks = 0usize;
    for (mut entry, reply) in entries.into_iter().zip(replies) {
        let mut detail = match reply_to_detail(reply, &projection) {
            Some(detail) => {
                ctx.recorder().record_hit();
                detail
            }
            None => {
                ctx.recorder().record_miss();
                fallbacks += 1;
                match entry.get_detail_where_no_cache().await? {
                    Some(detail) => detail,
                    None => continue,
                }
            }
        };

        entry.normalize(&mut detail);
        if !projection.is_empty() {
            detail = project(detail, &projection);
        }
        if !detail.is_empty() {
            resolved.push(detail);
        }
    }

    debug!(
        namespace = descriptor.namespace(),
        requested = ids.len(),
        resolved = resolved.len(),
        fallbacks,
        "batch fetch finished"
    );

    let key_field = key_field.filter(|k| projection.is_empty() || projection.iter().any(|f| f.as_str() == *k));
    Ok(match key_field {
        Some(key) if resolved.iter().all(|d| is_key(d.get(key))) => BatchResult::Keyed(
            resolved
                .into_iter()
                .map(|detail| {
                    let value = detail.get(key).map(encode_field).unwrap_or_default();
                    (value, detail)
                })
                .collect(),
        ),
        _ => BatchResult::Ordered(resolved),
    })
}

/// The pipelined read for one entry, in its own storage mode.
fn read_op(entry: &CacheEntry, projection: &[String]) -> ReadOp {
    let key = entry.cache_key().to_string();
    match entry.mode() {
        StorageMode::Blob => ReadOp::Get(key),
        StorageMode::FieldMap if projection.is_empty() => ReadOp::HashAll(key),
        StorageMode::FieldMap => ReadOp::HashFields(key, projection.to_vec()),
    }
}

/// `None` when the reply shows the entry missing.
fn reply_to_detail(reply: ReadReply, projection: &[String]) -> Option<Detail> {
    let detail = match reply {
        ReadReply::Value(raw) => raw.as_deref().map(decode_blob).unwrap_or_default(),
        ReadReply::Hash(hash) => decode_hash(hash),
        ReadReply::Fields(values) => hash_fields_to_detail(projection, values),
    };
    (!detail.is_empty()).then_some(detail)
}

fn is_key(value: Option<&Value>) -> bool {
    matches!(value, Some(v) if !v.is_null())
}
