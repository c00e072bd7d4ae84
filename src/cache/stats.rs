//! Cache Statistics Module
//!
//! Tracks cache effectiveness: hits and misses observed on the read path.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// == Cache Stats ==
/// Lock-free hit/miss counters shared by every reader of a cache.
///
/// Increments never lose updates; ordering between concurrent hit and miss
/// increments is not observable and not guaranteed.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Record Hit ==
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    // == Record Miss ==
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    // == Record Batch ==
    /// Adds the outcome of a bulk lookup in one step.
    pub fn record_batch(&self, hits: u64, misses: u64) {
        if hits > 0 {
            self.hits.fetch_add(hits, Ordering::Relaxed);
        }
        if misses > 0 {
            self.misses.fetch_add(misses, Ordering::Relaxed);
        }
    }

    // == Reset ==
    /// Zeroes both counters.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
        }
    }
}

// == Stats Snapshot ==
/// Serializable copy of a cache's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Number of successful cache retrievals
    pub hits: u64,
    /// Number of failed cache retrievals (key not found or expired)
    pub misses: u64,
}

impl StatsSnapshot {
    // == Hit Rate ==
    /// Returns hits / (hits + misses), or 0.0 if no requests have been made.
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
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_stats_new() {
        let stats = CacheStats::new();
        assert_eq!(stats.hits(), 0);
        assert_eq!(stats.misses(), 0);
    }

    #[test]
    fn test_hit_rate_no_requests() {
        let stats = CacheStats::new();
        assert_eq!(stats.snapshot().hit_rate(), 0.0);
    }

    #[test]
    fn test_hit_rate_mixed() {
        let stats = CacheStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        assert_eq!(stats.snapshot().hit_rate(), 0.75);
    }

    #[test]
    fn test_record_batch() {
        let stats = CacheStats::new();
        stats.record_batch(1, 2);
        stats.record_batch(0, 0);
        assert_eq!(stats.snapshot(), StatsSnapshot { hits: 1, misses: 2 });
    }

    #[test]
    fn test_reset_zeroes_both() {
        let stats = CacheStats::new();
        stats.record_hit();
        stats.record_miss();
        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let stats = Arc::new(CacheStats::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        if i % 2 == 0 {
                            stats.record_hit();
                        } else {
                            stats.record_miss();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stats.hits(), 4000);
        assert_eq!(stats.misses(), 4000);
    }

    #[test]
    fn test_snapshot_serialize() {
        let stats = CacheStats::new();
        stats.record_hit();
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert_eq!(json, r#"{"hits":1,"misses":0}"#);
    }
}
