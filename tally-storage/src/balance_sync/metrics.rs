use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for reconciliation activity since the queue was created.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    /// Drain cycles completed
    pub cycles: AtomicU64,

    /// Updates the authority accepted
    pub applied: AtomicU64,

    /// Updates dropped because the authority already held the target
    pub skipped: AtomicU64,

    /// Fetch or apply failures
    pub failed: AtomicU64,

    /// Failed updates put back for a later cycle
    pub requeued: AtomicU64,

    /// Failed updates given up on after exhausting their retries
    pub abandoned: AtomicU64,

    /// Enqueues rejected as duplicates of the pending target
    pub duplicates_suppressed: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            duplicates_suppressed: self.duplicates_suppressed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of sync metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncMetricsSnapshot {
    pub cycles: u64,
    pub applied: u64,
    pub skipped: u64,
    pub failed: u64,
    pub requeued: u64,
    pub abandoned: u64,
    pub duplicates_suppressed: u64,
}
