//! Balance reconciliation queue.
//!
//! Callers state the value an entity's balance should have; the queue keeps
//! only the latest request per entity and reconciles it with the external
//! [`BalanceAuthority`](tally_core::BalanceAuthority) in the background:
//! read the authoritative value, skip if it already matches, otherwise apply.
//!
//! # Example
//!
//! ```ignore
//! let queue = UpdateQueue::new(api_client, UpdateQueueOptions::from_env())?;
//!
//! queue.enqueue(EntityId::new(1101), 2_500.00, "payments")?;
//! queue.enqueue(EntityId::new(1101), 2_750.00, "payments")?; // replaces the first
//!
//! // Only 2_750.00 is ever written.
//! queue.wait_idle().await;
//! ```

pub mod metrics;
pub mod pending;
pub mod queue;

pub use metrics::{SyncMetrics, SyncMetricsSnapshot};
pub use pending::{group_by_source, EnqueueOutcome, PendingUpdate, PendingUpdates};
pub use queue::{QueueStatus, UpdateQueue};
