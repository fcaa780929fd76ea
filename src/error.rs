//! Error types for the entry cache
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the entry cache.
///
/// Absence of an entity is never an error: read paths return an empty detail
/// instead. Only contention, store/source failures and programmer errors
/// surface here.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Rebuild lock could not be acquired within the retry budget
    #[error("System busy: lock on {key} not acquired after {tries} tries")]
    Busy { key: String, tries: u32 },

    /// Store call failed (connection error, wrong value type, ...)
    #[error("Store error: {0}")]
    Store(String),

    /// Data source collaborator failed
    #[error("Source error: {0}")]
    Source(#[source] anyhow::Error),

    /// Record cannot be turned into a field mapping
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Blob encode/decode failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed configuration or unknown pool identifier
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CacheError {
    /// True for lock contention, which callers should treat as transient.
    pub fn is_busy(&self) -> bool {
        matches!(self, CacheError::Busy { .. })
    }

    /// Integer increment past the `i64` range, reported the way the store does.
    pub(crate) fn overflow() -> Self {
        CacheError::Store("increment or decrement would overflow".to_string())
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Store(err.to_string())
    }
}

// == Result Type Alias ==
/// Convenience Result type for the entry cache.
pub type Result<T> = std::result::Result<T, CacheError>;
