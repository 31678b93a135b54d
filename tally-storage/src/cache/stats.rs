//! Cache counters and point-in-time statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by every cache read.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Reads answered from a fresh entry.
    pub hits: AtomicU64,
    /// Reads answered from a stale entry while refreshing in the background.
    pub stale_hits: AtomicU64,
    /// Reads that had to run the loader.
    pub misses: AtomicU64,
    /// Reads that joined a load already in flight.
    pub coalesced: AtomicU64,
    /// Foreground loads that failed.
    pub load_failures: AtomicU64,
    /// Background refreshes that failed (stale data kept).
    pub revalidation_failures: AtomicU64,
    /// Entries dropped by the expiry sweeper.
    pub swept: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of all counters.
    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            revalidation_failures: self.revalidation_failures.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of cache counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub load_failures: u64,
    pub revalidation_failures: u64,
    pub swept: u64,
}

impl CacheMetricsSnapshot {
    /// Fraction of reads answered without waiting on a loader (0.0 to 1.0).
    ///
    /// Stale hits count as hits; coalesced reads count as misses.
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.stale_hits;
        let total = served + self.misses + self.coalesced;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}

/// Statistics about the cache contents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Number of entries currently holding data.
    pub size: usize,
    /// Keys of those entries, sorted.
    pub keys: Vec<String>,
    /// Keys with a load in flight, sorted.
    pub loading_keys: Vec<String>,
    pub metrics: CacheMetricsSnapshot,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        self.metrics.hit_rate()
    }
}
