//! Cache Statistics Module
//!
//! Tracks engine behaviour: hits, misses, rebuilds, negative-cache traffic and
//! lock contention. Counters are shared by every entity instance of a context.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

// == Stats Recorder ==
/// Lock-free counters updated by the engine.
#[derive(Debug, Default)]
pub struct StatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    rebuilds: AtomicU64,
    source_loads: AtomicU64,
    tombstone_hits: AtomicU64,
    tombstones_written: AtomicU64,
    lock_busy: AtomicU64,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rebuild(&self) {
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_source_load(&self) {
        self.source_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tombstone_hit(&self) {
        self.tombstone_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tombstone_written(&self) {
        self.tombstones_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_busy(&self) {
        self.lock_busy.fetch_add(1, Ordering::Relaxed);
    }

    // == Snapshot ==
    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            source_loads: self.source_loads.load(Ordering::Relaxed),
            tombstone_hits: self.tombstone_hits.load(Ordering::Relaxed),
            tombstones_written: self.tombstones_written.load(Ordering::Relaxed),
            lock_busy: self.lock_busy.load(Ordering::Relaxed),
            taken_at: Utc::now(),
        }
    }
}

// == Cache Stats ==
/// Serializable snapshot of the engine counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Detail reads answered by the store
    pub hits: u64,
    /// Detail reads that fell through to the rebuild path
    pub misses: u64,
    /// Full rebuilds performed
    pub rebuilds: u64,
    /// Calls made to data sources
    pub source_loads: u64,
    /// Rebuilds short-circuited by a tombstone
    pub tombstone_hits: u64,
    /// Tombstones written after the source confirmed absence
    pub tombstones_written: u64,
    /// Lock acquisitions that exhausted their retry budget
    pub lock_busy: u64,
    /// When the snapshot was taken
    pub taken_at: DateTime<Utc>,
}

impl CacheStats {
    // == Hit Rate ==
    /// Calculates the cache hit rate.
    ///
    /// Returns hits / (hits + misses), or 0.0 if no reads have been made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = StatsRecorder::new().snapshot();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.rebuilds, 0);
        assert_eq!(stats.lock_busy, 0);
    }

    #[test]
    fn test_hit_rate_no_requests() {
        let stats = StatsRecorder::new().snapshot();
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_mixed() {
        let recorder = StatsRecorder::new();
        recorder.record_hit();
        recorder.record_hit();
        recorder.record_hit();
        recorder.record_miss();
        assert_eq!(recorder.snapshot().hit_rate(), 0.75);
    }

    #[test]
    fn test_negative_cache_counters() {
        let recorder = StatsRecorder::new();
        recorder.record_tombstone_written();
        recorder.record_tombstone_hit();
        recorder.record_tombstone_hit();

        let stats = recorder.snapshot();
        assert_eq!(stats.tombstones_written, 1);
        assert_eq!(stats.tombstone_hits, 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let recorder = StatsRecorder::new();
        recorder.record_rebuild();
        let json = serde_json::to_string(&recorder.snapshot()).unwrap();
        assert!(json.contains("\"rebuilds\":1"));
        assert!(json.contains("taken_at"));
    }
}
