//! Tally Storage - Coordination over Shared Remote State
//!
//! Two in-memory components for many callers converging on the same remote
//! data:
//!
//! - [`cache`]: keyed read cache with TTL freshness, stale-while-revalidate
//!   and coalescing of concurrent loads, plus a parallel batch loader.
//! - [`balance_sync`]: latest-wins queue of balance changes, reconciled
//!   serially against an external authority.
//!
//! Both are explicitly constructed handles; clone them to share.

pub mod balance_sync;
pub mod cache;

use std::any::Any;

pub use balance_sync::{
    EnqueueOutcome, PendingUpdate, QueueStatus, SyncMetrics, SyncMetricsSnapshot, UpdateQueue,
};
pub use cache::{
    spawn_sweeper, BatchResult, CacheMetricsSnapshot, CacheRead, CacheStats, CacheStore,
    ParallelLoader, ReadSource,
};

// Re-export the shared types callers need alongside the components.
pub use tally_core::{
    BalanceAuthority, BalanceChange, CacheConfig, CacheOptions, EntityId, TallyError,
    TallyResult, TtlPolicy, UpdateQueueOptions,
};

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
