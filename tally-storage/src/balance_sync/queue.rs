//! The balance update queue and its drain loop.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::FutureExt;
use serde::Serialize;
use tally_core::{
    balances_match, BalanceAuthority, BalanceChange, EntityId, HealthCheck, StorageError,
    SyncError, TallyError, TallyResult, UpdateQueueOptions, ValidationError,
};
use tokio::sync::watch;
use tokio::time::Instant;

use super::metrics::{SyncMetrics, SyncMetricsSnapshot};
use super::pending::{group_by_source, EnqueueOutcome, PendingUpdate, PendingUpdates};
use crate::panic_message;

const COMPONENT: &str = "balance-sync";

/// Queue size and whether a drain loop is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub size: usize,
    pub is_processing: bool,
}

enum Reconciled {
    Applied { previous: f64 },
    AlreadySatisfied { current: f64 },
}

struct QueueState {
    pending: PendingUpdates,
    draining: bool,
}

struct Inner<A> {
    authority: A,
    options: UpdateQueueOptions,
    state: Mutex<QueueState>,
    metrics: SyncMetrics,
    /// Mirrors `QueueState::draining`; only written while `state` is locked.
    processing: watch::Sender<bool>,
}

impl<A: BalanceAuthority> Inner<A> {
    fn lock(&self) -> TallyResult<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| TallyError::Storage(StorageError::LockPoisoned))
    }

    /// Apply one snapshot, one update at a time.
    async fn run_cycle(&self, batch: Vec<PendingUpdate>) {
        let total = batch.len();
        let mut applied = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;

        for (source, group) in group_by_source(batch) {
            tracing::trace!(source = %source, updates = group.len(), "Reconciling source group");

            for update in group {
                let outcome = AssertUnwindSafe(self.reconcile(&update))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        Err(SyncError::AuthorityPanicked {
                            entity_id: update.entity_id,
                            reason: panic_message(payload.as_ref()),
                        }
                        .into())
                    });

                match outcome {
                    Ok(Reconciled::Applied { previous }) => {
                        applied += 1;
                        SyncMetrics::incr(&self.metrics.applied);
                        tracing::debug!(
                            entity_id = %update.entity_id,
                            old_value = previous,
                            new_value = update.target_value,
                            source = %update.source,
                            "Balance update applied"
                        );
                    }
                    Ok(Reconciled::AlreadySatisfied { current }) => {
                        skipped += 1;
                        SyncMetrics::incr(&self.metrics.skipped);
                        tracing::debug!(
                            entity_id = %update.entity_id,
                            current_value = current,
                            target_value = update.target_value,
                            "Balance already at target, skipping"
                        );
                    }
                    Err(e) => {
                        failed += 1;
                        self.handle_failure(update, e);
                    }
                }
            }
        }

        SyncMetrics::incr(&self.metrics.cycles);
        if total > 0 {
            tracing::info!(total, applied, skipped, failed, "Balance sync cycle completed");
        } else {
            tracing::trace!("Balance sync cycle completed with nothing to apply");
        }
    }

    async fn reconcile(&self, update: &PendingUpdate) -> TallyResult<Reconciled> {
        let current = self.authority.fetch_current_value(update.entity_id).await?;
        if balances_match(current, update.target_value) {
            return Ok(Reconciled::AlreadySatisfied { current });
        }

        let change = BalanceChange {
            entity_id: update.entity_id,
            old_value: current,
            new_value: update.target_value,
            source: update.source.clone(),
        };
        self.authority.apply_update(&change).await?;
        Ok(Reconciled::Applied { previous: current })
    }

    fn handle_failure(&self, update: PendingUpdate, error: TallyError) {
        SyncMetrics::incr(&self.metrics.failed);

        if let Some(max_retries) = self.options.max_retries {
            if update.attempts >= max_retries {
                SyncMetrics::incr(&self.metrics.abandoned);
                tracing::error!(
                    entity_id = %update.entity_id,
                    target_value = update.target_value,
                    source = %update.source,
                    attempts = update.attempts + 1,
                    error = %error,
                    "Abandoning balance update after exhausting retries"
                );
                return;
            }
        }

        tracing::error!(
            entity_id = %update.entity_id,
            target_value = update.target_value,
            source = %update.source,
            attempt = update.attempts + 1,
            error = %error,
            "Balance update failed, re-enqueueing"
        );

        let entity_id = update.entity_id;
        match self.lock() {
            Ok(mut state) => {
                if state.pending.requeue(update, Instant::now()) {
                    SyncMetrics::incr(&self.metrics.requeued);
                } else {
                    tracing::debug!(
                        entity_id = %entity_id,
                        "Newer update pending, dropping retry"
                    );
                }
            }
            Err(e) => {
                tracing::error!(entity_id = %entity_id, error = %e, "Failed to re-enqueue balance update");
            }
        }
    }

    /// Go idle if nothing is pending. Returns true when another cycle is due.
    fn finish_cycle(&self) -> TallyResult<bool> {
        let mut state = self.lock()?;
        if state.pending.is_empty() {
            state.draining = false;
            self.processing.send_replace(false);
            Ok(false)
        } else {
            Ok(true)
        }
    }
}

/// Marks the queue idle when a drain loop exits without finishing its last
/// cycle: an aborted drain, a panic, or the runtime dropping the task.
struct DrainGuard<'a, A> {
    inner: &'a Inner<A>,
    finished: bool,
}

impl<A> Drop for DrainGuard<'_, A> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = match self.inner.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.draining = false;
        self.inner.processing.send_replace(false);
        tracing::warn!(pending = state.pending.len(), "Balance sync drain stopped early");
    }
}

async fn drain_loop<A: BalanceAuthority>(inner: Arc<Inner<A>>) {
    let mut guard = DrainGuard {
        inner: &inner,
        finished: false,
    };

    loop {
        let batch = match inner.lock() {
            Ok(mut state) => state.pending.take_all(),
            Err(e) => {
                tracing::error!(error = %e, "Balance sync drain aborted");
                return;
            }
        };

        inner.run_cycle(batch).await;

        match inner.finish_cycle() {
            Ok(true) => tokio::time::sleep(inner.options.sync_interval).await,
            Ok(false) => {
                guard.finished = true;
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Balance sync drain aborted");
                return;
            }
        }
    }
}

/// Coalesces requested balance changes and reconciles them, one at a time,
/// against a [`BalanceAuthority`].
///
/// Each entity has at most one pending update; a newer request replaces an
/// older one unless the targets match within [`tally_core::BALANCE_EPSILON`].
/// Enqueueing starts a drain loop on the tokio runtime when none is running,
/// so [`enqueue`](Self::enqueue) must be called from within a runtime.
///
/// The loop takes every pending update, applies them grouped by source in
/// enqueue order, and repeats after `sync_interval` while new or re-enqueued
/// updates remain. Failures never reach the caller of `enqueue`.
pub struct UpdateQueue<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Clone for UpdateQueue<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: BalanceAuthority + 'static> UpdateQueue<A> {
    /// Create an idle queue after validating `options`.
    pub fn new(authority: A, options: UpdateQueueOptions) -> TallyResult<Self> {
        options.validate()?;
        Ok(Self::from_options(authority, options))
    }

    pub fn with_defaults(authority: A) -> Self {
        Self::from_options(authority, UpdateQueueOptions::default())
    }

    fn from_options(authority: A, options: UpdateQueueOptions) -> Self {
        let (processing, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                authority,
                options,
                state: Mutex::new(QueueState {
                    pending: PendingUpdates::new(),
                    draining: false,
                }),
                metrics: SyncMetrics::new(),
                processing,
            }),
        }
    }

    pub fn authority(&self) -> &A {
        &self.inner.authority
    }

    pub fn options(&self) -> &UpdateQueueOptions {
        &self.inner.options
    }

    /// Request that `entity_id` end up at `target_value`.
    ///
    /// Returns `Ok(false)` when the request duplicates the pending target.
    /// `source` is an opaque label and any string is accepted. Errors only
    /// for a non-finite target.
    pub fn enqueue(
        &self,
        entity_id: EntityId,
        target_value: f64,
        source: impl Into<String>,
    ) -> TallyResult<bool> {
        let source = source.into();
        if !target_value.is_finite() {
            return Err(ValidationError::InvalidValue {
                field: "target_value".to_string(),
                reason: format!("{} is not a finite number", target_value),
            }
            .into());
        }

        let start_drain = {
            let mut state = self.inner.lock()?;
            let outcome = state.pending.enqueue(
                entity_id,
                target_value,
                source,
                Instant::now(),
                self.inner.options.prevent_duplicates,
            );

            match outcome {
                EnqueueOutcome::DuplicateSuppressed => {
                    SyncMetrics::incr(&self.inner.metrics.duplicates_suppressed);
                    tracing::debug!(
                        entity_id = %entity_id,
                        target_value,
                        "Duplicate balance update suppressed"
                    );
                    return Ok(false);
                }
                EnqueueOutcome::Replaced { previous_target } => {
                    tracing::debug!(
                        entity_id = %entity_id,
                        previous_target,
                        target_value,
                        "Pending balance update replaced"
                    );
                }
                EnqueueOutcome::Queued => {}
            }

            if state.draining {
                false
            } else {
                state.draining = true;
                self.inner.processing.send_replace(true);
                true
            }
        };

        if start_drain {
            tokio::spawn(drain_loop(Arc::clone(&self.inner)));
        }
        Ok(true)
    }

    /// Resolves once no drain loop is running.
    pub async fn wait_idle(&self) {
        let mut processing = self.inner.processing.subscribe();
        loop {
            let busy = *processing.borrow_and_update();
            if !busy || processing.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn queue_status(&self) -> TallyResult<QueueStatus> {
        let state = self.inner.lock()?;
        Ok(QueueStatus {
            size: state.pending.len(),
            is_processing: state.draining,
        })
    }

    /// Copy of the queued updates, oldest first.
    pub fn pending(&self) -> TallyResult<Vec<PendingUpdate>> {
        Ok(self.inner.lock()?.pending.snapshot())
    }

    pub fn metrics(&self) -> SyncMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Degraded once any update has been abandoned.
    pub fn health(&self) -> HealthCheck {
        let status = match self.queue_status() {
            Ok(status) => status,
            Err(e) => return HealthCheck::unhealthy(COMPONENT, e.to_string()),
        };
        let metrics = self.metrics();

        let check = if metrics.abandoned > 0 {
            HealthCheck::degraded(
                COMPONENT,
                format!("{} balance updates abandoned", metrics.abandoned),
            )
        } else {
            HealthCheck::healthy(COMPONENT)
        };

        check
            .with_metadata("pending", serde_json::json!(status.size))
            .with_metadata("processing", serde_json::json!(status.is_processing))
            .with_metadata(
                "metrics",
                serde_json::to_value(metrics).unwrap_or_default(),
            )
    }
}

impl<A> std::fmt::Debug for UpdateQueue<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateQueue")
            .field("options", &self.inner.options)
            .field("metrics", &self.inner.metrics.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tally_core::{ConfigError, HealthStatus};
    use tally_test_utils::MockBalanceAuthority;

    fn id(n: u64) -> EntityId {
        EntityId::new(n)
    }

    fn queue(authority: &Arc<MockBalanceAuthority>) -> UpdateQueue<Arc<MockBalanceAuthority>> {
        UpdateQueue::new(
            Arc::clone(authority),
            UpdateQueueOptions::new().with_sync_interval(Duration::from_millis(100)),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_starts_drain_and_applies() {
        let authority = Arc::new(MockBalanceAuthority::new().with_balance(id(7), 50.0));
        let queue = queue(&authority);

        assert!(queue.enqueue(id(7), 150.0, "payments").unwrap());
        assert!(queue.queue_status().unwrap().is_processing);

        queue.wait_idle().await;

        let applied = authority.applied();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].old_value, 50.0);
        assert_eq!(applied[0].new_value, 150.0);
        assert_eq!(applied[0].source, "payments");
        assert_eq!(
            queue.queue_status().unwrap(),
            QueueStatus {
                size: 0,
                is_processing: false
            }
        );
        assert_eq!(queue.metrics().cycles, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_rejects_non_finite_target() {
        let authority = Arc::new(MockBalanceAuthority::new());
        let queue = queue(&authority);

        assert!(matches!(
            queue.enqueue(id(1), f64::NAN, "payments"),
            Err(TallyError::Validation(ValidationError::InvalidValue { .. }))
        ));
        assert!(matches!(
            queue.enqueue(id(1), f64::INFINITY, "payments"),
            Err(TallyError::Validation(ValidationError::InvalidValue { .. }))
        ));
        assert_eq!(queue.queue_status().unwrap().size, 0);
        assert!(!queue.queue_status().unwrap().is_processing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_source_is_an_ordinary_label() {
        let authority = Arc::new(MockBalanceAuthority::new());
        let queue = queue(&authority);

        assert!(queue.enqueue(id(1), 1.0, "").unwrap());
        assert!(queue.enqueue(id(2), 2.0, "  ").unwrap());
        queue.wait_idle().await;

        let sources: Vec<String> = authority.applied().into_iter().map(|c| c.source).collect();
        assert_eq!(sources, vec!["".to_string(), "  ".to_string()]);
    }

    #[test]
    fn test_new_rejects_zero_sync_interval() {
        let authority = Arc::new(MockBalanceAuthority::new());
        let options = UpdateQueueOptions::new()
            .with_unbounded_retries()
            .with_sync_interval(Duration::ZERO);

        match UpdateQueue::new(authority, options) {
            Err(TallyError::Config(ConfigError::InvalidValue { field, .. })) => {
                assert_eq!(field, "sync_interval")
            }
            other => panic!("expected invalid sync interval, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_authority_is_retried_and_queue_goes_idle() {
        let authority = Arc::new(MockBalanceAuthority::new());
        authority.panic_next_applies(1);
        let queue = queue(&authority);

        queue.enqueue(id(6), 60.0, "payments").unwrap();
        queue.wait_idle().await;

        assert_eq!(authority.balance(id(6)), Some(60.0));
        let metrics = queue.metrics();
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.requeued, 1);
        assert_eq!(metrics.cycles, 2);

        // The queue still starts new drains afterwards.
        queue.enqueue(id(6), 61.0, "payments").unwrap();
        queue.wait_idle().await;
        assert_eq!(authority.balance(id(6)), Some(61.0));
        assert!(!queue.queue_status().unwrap().is_processing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_during_cycle_runs_follow_up_cycle() {
        let authority = Arc::new(
            MockBalanceAuthority::new().with_latency(Duration::from_millis(10)),
        );
        let queue = queue(&authority);

        queue.enqueue(id(1), 10.0, "A").unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        queue.enqueue(id(2), 20.0, "A").unwrap();

        // The running cycle only took entity 1.
        assert_eq!(queue.queue_status().unwrap().size, 1);

        queue.wait_idle().await;
        assert_eq!(authority.balance(id(1)), Some(10.0));
        assert_eq!(authority.balance(id(2)), Some(20.0));
        assert_eq!(queue.metrics().cycles, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_update_is_abandoned_after_max_retries() {
        let authority = Arc::new(MockBalanceAuthority::new());
        authority.fail_next_applies(10);
        let queue = UpdateQueue::new(
            Arc::clone(&authority),
            UpdateQueueOptions::new()
                .with_max_retries(2)
                .with_sync_interval(Duration::from_millis(100)),
        )
        .unwrap();

        queue.enqueue(id(3), 99.0, "journal").unwrap();
        queue.wait_idle().await;

        let metrics = queue.metrics();
        assert_eq!(metrics.failed, 3);
        assert_eq!(metrics.requeued, 2);
        assert_eq!(metrics.abandoned, 1);
        assert_eq!(queue.queue_status().unwrap().size, 0);
        assert!(authority.applied().is_empty());

        let health = queue.health();
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.component, "balance-sync");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_retries_eventually_apply() {
        let authority = Arc::new(MockBalanceAuthority::new());
        authority.fail_next_fetches(5);
        let queue = UpdateQueue::new(
            Arc::clone(&authority),
            UpdateQueueOptions::new()
                .with_unbounded_retries()
                .with_sync_interval(Duration::from_millis(100)),
        )
        .unwrap();

        queue.enqueue(id(4), 12.5, "A").unwrap();
        queue.wait_idle().await;

        assert_eq!(authority.balance(id(4)), Some(12.5));
        assert_eq!(queue.metrics().requeued, 5);
        assert_eq!(queue.metrics().abandoned, 0);
        assert!(queue.health().is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_enqueue_survives_failed_retry() {
        let authority = Arc::new(
            MockBalanceAuthority::new().with_latency(Duration::from_millis(10)),
        );
        authority.fail_next_applies(1);
        let queue = queue(&authority);

        queue.enqueue(id(5), 1.0, "A").unwrap();
        // Lands while the first apply is in flight and about to fail.
        tokio::time::sleep(Duration::from_millis(15)).await;
        queue.enqueue(id(5), 2.0, "A").unwrap();

        queue.wait_idle().await;

        assert_eq!(authority.balance(id(5)), Some(2.0));
        let targets: Vec<f64> = authority.applied().iter().map(|c| c.new_value).collect();
        assert_eq!(targets, vec![2.0]);
        assert_eq!(queue.metrics().requeued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_snapshot_and_health_metadata() {
        let authority = Arc::new(MockBalanceAuthority::new());
        let queue = queue(&authority);

        queue.enqueue(id(9), 5.0, "A").unwrap();
        queue.enqueue(id(8), 6.0, "B").unwrap();

        let pending = queue.pending().unwrap();
        let ids: Vec<u64> = pending.iter().map(|u| u.entity_id.get()).collect();
        assert_eq!(ids, vec![9, 8]);

        let metadata = queue.health().metadata.unwrap();
        assert_eq!(metadata["pending"], serde_json::json!(2));
        assert_eq!(metadata["processing"], serde_json::json!(true));

        queue.wait_idle().await;
        assert!(queue.pending().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_surfaces_as_sync_error_in_metrics() {
        let authority = Arc::new(MockBalanceAuthority::new());
        authority.fail_next_fetches(1);
        let queue = queue(&authority);

        queue.enqueue(id(1), 1.0, "A").unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(queue.metrics().failed, 1);
        assert_eq!(queue.queue_status().unwrap().size, 1);
        assert!(matches!(
            authority.last_error(),
            Some(TallyError::Sync(SyncError::FetchFailed { .. }))
        ));

        queue.wait_idle().await;
        assert_eq!(authority.balance(id(1)), Some(1.0));
    }
}
