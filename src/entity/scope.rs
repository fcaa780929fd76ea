//! Request Scope
//!
//! Memoizes entries for the duration of one logical operation so every caller
//! asking for the same entity shares one mirror. Nothing outlives the scope.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::Mutex;

use super::{CacheEntry, EntityDescriptor};
use crate::context::CacheContext;
use crate::error::Result;

type ScopeKey = (String, String, String);

/// Per-operation memo of [`CacheEntry`] instances keyed by
/// `(namespace, pool, pk)`.
#[derive(Default)]
pub struct RequestScope {
    entries: StdMutex<HashMap<ScopeKey, Arc<Mutex<CacheEntry>>>>,
}

impl RequestScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared entry for `pk` in the descriptor's pool.
    pub async fn entry(
        &self,
        ctx: &Arc<CacheContext>,
        descriptor: &Arc<EntityDescriptor>,
        pk: &str,
    ) -> Result<Arc<Mutex<CacheEntry>>> {
        self.entry_in_pool(ctx, descriptor, descriptor.pool(), pk).await
    }

    /// Shared entry for `pk` in an explicit pool.
    pub async fn entry_in_pool(
        &self,
        ctx: &Arc<CacheContext>,
        descriptor: &Arc<EntityDescriptor>,
        pool: &str,
        pk: &str,
    ) -> Result<Arc<Mutex<CacheEntry>>> {
        let key = (
            descriptor.namespace().to_string(),
            pool.to_string(),
            pk.to_string(),
        );
        if let Some(entry) = self.lookup(&key) {
            return Ok(entry);
        }

        let entry = CacheEntry::in_pool(Arc::clone(ctx), Arc::clone(descriptor), pool, pk).await?;
        // A concurrent caller may have memoized the same key meanwhile; theirs wins.
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(Arc::clone(
            entries
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(entry))),
        ))
    }

    fn lookup(&self, key: &ScopeKey) -> Option<Arc<Mutex<CacheEntry>>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
