//! Tally Test Utilities
//!
//! Shared test infrastructure for the tally workspace:
//! - Mock balance authority with failure injection
//! - Scripted cache loaders that count invocations
//! - Proptest generators for queue inputs

pub use tally_core::{
    BalanceAuthority, BalanceChange, CacheOptions, EntityId, SyncError, TallyError, TallyResult,
    UpdateQueueOptions,
};

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Decrement `counter` if positive. Returns true when it was.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ============================================================================
// MOCK BALANCE AUTHORITY
// ============================================================================

/// In-memory balance authority for testing.
///
/// Unknown entities read as `0.0`. Successful applies write the new value
/// and are recorded in order. Failures are injected per call with
/// [`fail_next_fetches`](Self::fail_next_fetches) and
/// [`fail_next_applies`](Self::fail_next_applies) (or turned into panics
/// with [`panic_next_applies`](Self::panic_next_applies)), and the mock tracks how
/// many calls overlapped so tests can assert serialized application.
#[derive(Debug, Default)]
pub struct MockBalanceAuthority {
    balances: Mutex<HashMap<EntityId, f64>>,
    applied: Mutex<Vec<BalanceChange>>,
    last_error: Mutex<Option<TallyError>>,
    fetches: AtomicUsize,
    fail_fetches: AtomicU32,
    fail_applies: AtomicU32,
    panic_applies: AtomicU32,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    latency: Duration,
}

struct CallGuard<'a>(&'a AtomicUsize);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockBalanceAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the authoritative value of an entity.
    pub fn with_balance(self, entity_id: EntityId, value: f64) -> Self {
        self.set_balance(entity_id, value);
        self
    }

    /// Delay every call by `latency` (virtual time under a paused runtime).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_balance(&self, entity_id: EntityId, value: f64) {
        lock(&self.balances).insert(entity_id, value);
    }

    pub fn balance(&self, entity_id: EntityId) -> Option<f64> {
        lock(&self.balances).get(&entity_id).copied()
    }

    /// Every successful apply, in order.
    pub fn applied(&self) -> Vec<BalanceChange> {
        lock(&self.applied).clone()
    }

    pub fn apply_count(&self) -> usize {
        lock(&self.applied).len()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Fail the next `n` calls to `fetch_current_value`.
    pub fn fail_next_fetches(&self, n: u32) {
        self.fail_fetches.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` calls to `apply_update`.
    pub fn fail_next_applies(&self, n: u32) {
        self.fail_applies.store(n, Ordering::SeqCst);
    }

    /// Panic inside the next `n` calls to `apply_update`.
    pub fn panic_next_applies(&self, n: u32) {
        self.panic_applies.store(n, Ordering::SeqCst);
    }

    /// The most recent injected failure.
    pub fn last_error(&self) -> Option<TallyError> {
        lock(&self.last_error).clone()
    }

    /// Highest number of calls that were in progress at the same time.
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> CallGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = CallGuard(&self.in_flight);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        guard
    }

    fn fail(&self, error: SyncError) -> TallyError {
        let error = TallyError::Sync(error);
        *lock(&self.last_error) = Some(error.clone());
        error
    }
}

#[async_trait]
impl BalanceAuthority for MockBalanceAuthority {
    async fn fetch_current_value(&self, entity_id: EntityId) -> TallyResult<f64> {
        let _call = self.enter().await;
        self.fetches.fetch_add(1, Ordering::SeqCst);

        if take_one(&self.fail_fetches) {
            return Err(self.fail(SyncError::FetchFailed {
                entity_id,
                reason: "injected fetch failure".to_string(),
            }));
        }
        Ok(self.balance(entity_id).unwrap_or(0.0))
    }

    async fn apply_update(&self, change: &BalanceChange) -> TallyResult<()> {
        let _call = self.enter().await;

        if take_one(&self.panic_applies) {
            panic!("injected apply panic for entity {}", change.entity_id);
        }
        if take_one(&self.fail_applies) {
            return Err(self.fail(SyncError::ApplyFailed {
                entity_id: change.entity_id,
                reason: "injected apply failure".to_string(),
            }));
        }
        self.set_balance(change.entity_id, change.new_value);
        lock(&self.applied).push(change.clone());
        Ok(())
    }
}

// ============================================================================
// COUNTING LOADER
// ============================================================================

/// Loader factory for cache tests.
///
/// Each call to [`loader`](Self::loader) hands out a one-shot loader. Loaders
/// pop scripted responses first and fall back to the default response once
/// the script is exhausted. Clones share the counter and script.
#[derive(Debug, Clone)]
pub struct CountingLoader<T> {
    calls: Arc<AtomicUsize>,
    script: Arc<Mutex<VecDeque<TallyResult<T>>>>,
    fallback: TallyResult<T>,
    latency: Duration,
}

impl<T: Clone + Send + Sync + 'static> CountingLoader<T> {
    /// Always succeed with `value`.
    pub fn ok(value: T) -> Self {
        Self::with_fallback(Ok(value))
    }

    /// Always fail with a load error for `key`.
    pub fn failing(key: &str, reason: &str) -> Self {
        Self::with_fallback(Err(TallyError::load_failed(key, reason)))
    }

    fn with_fallback(fallback: TallyResult<T>) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback,
            latency: Duration::ZERO,
        }
    }

    /// Delay every load by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue a one-off response ahead of the fallback.
    pub fn then(self, response: TallyResult<T>) -> Self {
        lock(&self.script).push_back(response);
        self
    }

    /// Number of loaders that actually ran.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// A one-shot loader suitable for `CacheStore::get_or_load`.
    pub fn loader(&self) -> impl FnOnce() -> BoxFuture<'static, TallyResult<T>> + Send + 'static {
        let this = self.clone();
        move || {
            async move {
                this.calls.fetch_add(1, Ordering::SeqCst);
                if !this.latency.is_zero() {
                    tokio::time::sleep(this.latency).await;
                }
                let scripted = lock(&this.script).pop_front();
                scripted.unwrap_or_else(|| this.fallback.clone())
            }
            .boxed()
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod strategies {
    use super::*;
    use proptest::prelude::*;

    pub fn arb_entity_id() -> impl Strategy<Value = EntityId> {
        (1u64..50).prop_map(EntityId::new)
    }

    /// Balances with cent precision.
    pub fn arb_balance() -> impl Strategy<Value = f64> {
        (-10_000_000i64..10_000_000).prop_map(|cents| cents as f64 / 100.0)
    }

    pub fn arb_source() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("payments".to_string()),
            Just("journal".to_string()),
            Just("sales".to_string()),
            Just("purchases".to_string()),
        ]
    }

    /// A sequence of `(entity, target, source)` enqueue requests.
    pub fn arb_enqueue_ops(max: usize) -> impl Strategy<Value = Vec<(EntityId, f64, String)>> {
        prop::collection::vec((arb_entity_id(), arb_balance(), arb_source()), 1..max)
    }
}

// ============================================================================
// TRACING
// ============================================================================

/// Route tracing output through the test harness. Safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("tally_storage=debug"))
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_authority_applies_and_records() {
        let authority = MockBalanceAuthority::new().with_balance(EntityId::new(1), 10.0);
        assert_eq!(authority.fetch_current_value(EntityId::new(1)).await.unwrap(), 10.0);
        assert_eq!(authority.fetch_current_value(EntityId::new(2)).await.unwrap(), 0.0);

        let change = BalanceChange {
            entity_id: EntityId::new(1),
            old_value: 10.0,
            new_value: 25.0,
            source: "journal".to_string(),
        };
        authority.apply_update(&change).await.unwrap();

        assert_eq!(authority.balance(EntityId::new(1)), Some(25.0));
        assert_eq!(authority.applied(), vec![change]);
        assert_eq!(authority.fetch_count(), 2);
        assert_eq!(authority.max_concurrent_calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_authority_injected_failures_are_consumed() {
        let authority = MockBalanceAuthority::new();
        authority.fail_next_fetches(1);

        assert!(authority.fetch_current_value(EntityId::new(1)).await.is_err());
        assert!(authority.fetch_current_value(EntityId::new(1)).await.is_ok());
        assert!(matches!(
            authority.last_error(),
            Some(TallyError::Sync(SyncError::FetchFailed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_counting_loader_script_then_fallback() {
        let loader = CountingLoader::ok(1u32).then(Ok(7)).then(Err(TallyError::load_failed("k", "x")));

        assert_eq!((loader.loader())().await.unwrap(), 7);
        assert!((loader.loader())().await.is_err());
        assert_eq!((loader.loader())().await.unwrap(), 1);
        assert_eq!(loader.calls(), 3);
    }
}
