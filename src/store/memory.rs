//! Memory Store Module
//!
//! In-process store gateway: a HashMap of TTL entries behind an async RwLock.
//! Expired entries are dropped lazily on access and in bulk by the background
//! sweeper (see `tasks`). Used by tests and by the demo binary when no Redis URL
//! is configured.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ReadOp, ReadReply, StoreGateway, StoredEntry, StoredValue, TTL_MISSING, TTL_PERSISTENT};
use crate::error::{CacheError, Result};

type Entries = HashMap<String, StoredEntry>;

// == Memory Store ==
/// Shared in-memory store. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<Entries>>,
}

impl MemoryStore {
    // == Constructor ==
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    // == Cleanup Expired ==
    /// Removes all expired entries from the store.
    ///
    /// Returns the number of entries removed.
    pub async fn cleanup_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        before - entries.len()
    }

    // == Length ==
    /// Returns the number of entries, expired ones included until swept.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    // == Is Empty ==
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

// == Internal Helpers ==

fn wrong_type(key: &str, found: &StoredValue) -> CacheError {
    CacheError::Store(format!(
        "WRONGTYPE operation against key '{}' holding a {}",
        key,
        found.type_name()
    ))
}

/// Drops `key` if it has expired, so callers only ever see live entries.
fn purge(entries: &mut Entries, key: &str) {
    if entries.get(key).is_some_and(StoredEntry::is_expired) {
        entries.remove(key);
    }
}

fn read_string(entries: &mut Entries, key: &str) -> Result<Option<String>> {
    purge(entries, key);
    match entries.get(key) {
        None => Ok(None),
        Some(entry) => match &entry.value {
            StoredValue::Str(s) => Ok(Some(s.clone())),
            other => Err(wrong_type(key, other)),
        },
    }
}

fn read_hash(entries: &mut Entries, key: &str) -> Result<HashMap<String, String>> {
    purge(entries, key);
    match entries.get(key) {
        None => Ok(HashMap::new()),
        Some(entry) => match &entry.value {
            StoredValue::Hash(h) => Ok(h.clone()),
            other => Err(wrong_type(key, other)),
        },
    }
}

fn read_hash_fields(
    entries: &mut Entries,
    key: &str,
    fields: &[String],
) -> Result<Vec<Option<String>>> {
    let hash = read_hash(entries, key)?;
    Ok(fields.iter().map(|f| hash.get(f).cloned()).collect())
}

/// Live hash at `key`, created empty (without TTL) when missing.
fn hash_mut<'a>(entries: &'a mut Entries, key: &str) -> Result<&'a mut HashMap<String, String>> {
    purge(entries, key);
    let entry = entries
        .entry(key.to_string())
        .or_insert_with(|| StoredEntry::new(StoredValue::Hash(HashMap::new()), None));
    match &mut entry.value {
        StoredValue::Hash(h) => Ok(h),
        other => Err(wrong_type(key, other)),
    }
}

fn list_mut<'a>(entries: &'a mut Entries, key: &str) -> Result<&'a mut VecDeque<String>> {
    purge(entries, key);
    let entry = entries
        .entry(key.to_string())
        .or_insert_with(|| StoredEntry::new(StoredValue::List(VecDeque::new()), None));
    match &mut entry.value {
        StoredValue::List(l) => Ok(l),
        other => Err(wrong_type(key, other)),
    }
}

fn set_mut<'a>(entries: &'a mut Entries, key: &str) -> Result<&'a mut HashSet<String>> {
    purge(entries, key);
    let entry = entries
        .entry(key.to_string())
        .or_insert_with(|| StoredEntry::new(StoredValue::Set(HashSet::new()), None));
    match &mut entry.value {
        StoredValue::Set(s) => Ok(s),
        other => Err(wrong_type(key, other)),
    }
}

/// Removes a collection key that became empty.
fn drop_if_empty(entries: &mut Entries, key: &str) {
    if entries
        .get(key)
        .is_some_and(|entry| entry.value.is_empty_collection())
    {
        entries.remove(key);
    }
}

#[async_trait]
impl StoreGateway for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.write().await;
        read_string(&mut entries, key)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            StoredEntry::new(StoredValue::Str(value.to_string()), None),
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            StoredEntry::new(StoredValue::Str(value.to_string()), Some(ttl_secs)),
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut entries = self.entries.write().await;
        purge(&mut entries, key);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            StoredEntry::new(StoredValue::Str(value.to_string()), Some(ttl_secs)),
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<u64> {
        let mut entries = self.entries.write().await;
        purge(&mut entries, key);
        Ok(entries.remove(key).map_or(0, |_| 1))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        purge(&mut entries, key);
        Ok(entries.contains_key(key))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        let mut entries = self.entries.write().await;
        purge(&mut entries, key);
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expire_in(ttl_secs);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let mut entries = self.entries.write().await;
        purge(&mut entries, key);
        Ok(match entries.get(key) {
            None => TTL_MISSING,
            Some(entry) => entry
                .ttl_remaining()
                .map_or(TTL_PERSISTENT, |secs| secs as i64),
        })
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut entries = self.entries.write().await;
        purge(&mut entries, key);
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry::new(StoredValue::Str("0".to_string()), None));
        match &mut entry.value {
            StoredValue::Str(s) => {
                let next = s
                    .parse::<i64>()
                    .map_err(|_| CacheError::Store("value is not an integer".to_string()))?
                    .checked_add(1)
                    .ok_or_else(CacheError::overflow)?;
                *s = next.to_string();
                Ok(next)
            }
            other => Err(wrong_type(key, other)),
        }
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut entries = self.entries.write().await;
        read_hash(&mut entries, key)
    }

    async fn hmget(&self, key: &str, fields: &[String]) -> Result<Vec<Option<String>>> {
        let mut entries = self.entries.write().await;
        read_hash_fields(&mut entries, key, fields)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        hash_mut(&mut entries, key)?.insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hmset(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut entries = self.entries.write().await;
        let hash = hash_mut(&mut entries, key)?;
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        drop_if_empty(&mut entries, key);
        Ok(())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut entries = self.entries.write().await;
        let hash = hash_mut(&mut entries, key)?;
        let current = match hash.get(field) {
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| CacheError::Store("hash value is not an integer".to_string()))?,
            None => 0,
        };
        let next = current.checked_add(delta).ok_or_else(CacheError::overflow)?;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hincr_by_float(&self, key: &str, field: &str, delta: f64) -> Result<f64> {
        let mut entries = self.entries.write().await;
        let hash = hash_mut(&mut entries, key)?;
        let current = match hash.get(field) {
            Some(raw) => raw
                .parse::<f64>()
                .map_err(|_| CacheError::Store("hash value is not a float".to_string()))?,
            None => 0.0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn lpush(&self, key: &str, value: &str) -> Result<u64> {
        let mut entries = self.entries.write().await;
        let list = list_mut(&mut entries, key)?;
        list.push_front(value.to_string());
        Ok(list.len() as u64)
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.write().await;
        purge(&mut entries, key);
        if !entries.contains_key(key) {
            return Ok(None);
        }
        let popped = list_mut(&mut entries, key)?.pop_back();
        drop_if_empty(&mut entries, key);
        Ok(popped)
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let mut entries = self.entries.write().await;
        purge(&mut entries, key);
        match entries.get(key) {
            None => Ok(0),
            Some(entry) => match &entry.value {
                StoredValue::List(l) => Ok(l.len() as u64),
                other => Err(wrong_type(key, other)),
            },
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        Ok(set_mut(&mut entries, key)?.insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        purge(&mut entries, key);
        if !entries.contains_key(key) {
            return Ok(false);
        }
        let removed = set_mut(&mut entries, key)?.remove(member);
        drop_if_empty(&mut entries, key);
        Ok(removed)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.smembers(key).await?.iter().any(|m| m == member))
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        Ok(self.smembers(key).await?.len() as u64)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut entries = self.entries.write().await;
        purge(&mut entries, key);
        match entries.get(key) {
            None => Ok(Vec::new()),
            Some(entry) => match &entry.value {
                StoredValue::Set(s) => {
                    let mut members: Vec<String> = s.iter().cloned().collect();
                    members.sort();
                    Ok(members)
                }
                other => Err(wrong_type(key, other)),
            },
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        let mut keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn pipeline(&self, ops: &[ReadOp]) -> Result<Vec<ReadReply>> {
        let mut entries = self.entries.write().await;
        ops.iter()
            .map(|op| match op {
                ReadOp::Get(key) => read_string(&mut entries, key).map(ReadReply::Value),
                ReadOp::HashAll(key) => read_hash(&mut entries, key).map(ReadReply::Hash),
                ReadOp::HashFields(key, fields) => {
                    read_hash_fields(&mut entries, key, fields).map(ReadReply::Fields)
                }
            })
            .collect()
    }
}
