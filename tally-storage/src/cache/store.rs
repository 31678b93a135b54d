//! Keyed in-memory cache with TTL freshness, stale-while-revalidate and
//! coalescing of concurrent loads.
//!
//! Routing of a read, decided under a single lock acquisition:
//!
//! 1. fresh entry, nothing loading: return it.
//! 2. stale entry, nothing loading, `stale_while_revalidate`: return it and
//!    start a background refresh.
//! 3. a load is in flight: await that load.
//! 4. otherwise: start a load and await it.
//!
//! Loads run on their own tokio task and are shared through
//! [`futures_util::future::Shared`], so every caller that joins a load sees
//! the same outcome and a caller dropping its read never cancels the load.
//! A loader that panics settles its load as [`CacheError::LoadFailed`].

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tally_core::{
    CacheConfig, CacheError, CacheOptions, HealthCheck, StorageError, TallyError, TallyResult,
};
use tokio::time::Instant;

use super::read::{CacheRead, ReadSource};
use crate::panic_message;
use super::stats::{CacheMetrics, CacheMetricsSnapshot, CacheStats};

const COMPONENT: &str = "cache";

type AnyValue = Arc<dyn Any + Send + Sync>;
type LoadOutcome = Result<AnyValue, TallyError>;
type InFlight = Shared<BoxFuture<'static, LoadOutcome>>;

struct CacheEntry {
    data: AnyValue,
    stored_at: Instant,
}

impl CacheEntry {
    fn new(data: AnyValue) -> Self {
        Self {
            data,
            stored_at: Instant::now(),
        }
    }

    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.stored_at)
    }
}

struct Load {
    id: u64,
    future: InFlight,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    in_flight: HashMap<String, Load>,
}

enum LoadKind {
    /// A caller is waiting; failure removes the entry and is returned.
    Foreground,
    /// Failure keeps `stale` and resolves to it.
    Revalidate { stale: AnyValue },
}

enum Plan {
    Ready {
        data: AnyValue,
        stored_at: Instant,
        source: ReadSource,
    },
    Await {
        future: InFlight,
        source: ReadSource,
    },
}

struct Inner {
    state: Mutex<CacheState>,
    metrics: CacheMetrics,
    config: CacheConfig,
    next_load_id: AtomicU64,
}

impl Inner {
    fn lock(&self) -> TallyResult<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| TallyError::Storage(StorageError::LockPoisoned))
    }

    /// Record the outcome of load `id`. Runs exactly once per load, inside
    /// the shared future.
    fn finish_load(
        &self,
        key: &str,
        id: u64,
        result: TallyResult<AnyValue>,
        kind: LoadKind,
    ) -> LoadOutcome {
        let mut state = self.lock()?;
        if state.in_flight.get(key).is_some_and(|load| load.id == id) {
            state.in_flight.remove(key);
        }

        match (result, kind) {
            (Ok(value), _) => {
                state
                    .entries
                    .insert(key.to_string(), CacheEntry::new(Arc::clone(&value)));
                Ok(value)
            }
            (Err(e), LoadKind::Foreground) => {
                state.entries.remove(key);
                CacheMetrics::incr(&self.metrics.load_failures);
                tracing::debug!(key = %key, error = %e, "Cache load failed");
                Err(e)
            }
            (Err(e), LoadKind::Revalidate { stale }) => {
                CacheMetrics::incr(&self.metrics.revalidation_failures);
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "Background revalidation failed, keeping stale data"
                );
                Ok(stale)
            }
        }
    }
}

fn downcast<T: Clone + 'static>(key: &str, value: &AnyValue) -> TallyResult<T> {
    (**value).downcast_ref::<T>().cloned().ok_or_else(|| {
        TallyError::Cache(CacheError::TypeMismatch {
            key: key.to_string(),
            expected: type_name::<T>(),
        })
    })
}

/// In-memory cache shared by every reader in the process.
///
/// Cloning is cheap and yields a handle to the same cache. Values of any
/// `Clone + Send + Sync` type can be stored; each read names the type it
/// expects and gets [`CacheError::TypeMismatch`] if the key holds another.
///
/// All reads must run inside a tokio runtime: loads are spawned as tasks.
///
/// # Example
///
/// ```ignore
/// let cache = CacheStore::new(CacheConfig::from_env())?;
/// let accounts: Vec<Account> = cache
///     .get_or_load("accounts", move || api.list_accounts(), CacheOptions::default())
///     .await?;
/// ```
#[derive(Clone)]
pub struct CacheStore {
    inner: Arc<Inner>,
}

impl CacheStore {
    /// Create an empty cache after validating `config`.
    pub fn new(config: CacheConfig) -> TallyResult<Self> {
        config.validate()?;
        Ok(Self::from_config(config))
    }

    /// Create an empty cache with default configuration.
    pub fn with_defaults() -> Self {
        Self::from_config(CacheConfig::default())
    }

    fn from_config(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CacheState::default()),
                metrics: CacheMetrics::new(),
                config,
                next_load_id: AtomicU64::new(0),
            }),
        }
    }

    /// Get the cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Return the value for `key`, running `loader` only when needed.
    pub async fn get_or_load<T, F, Fut>(
        &self,
        key: &str,
        loader: F,
        options: CacheOptions,
    ) -> TallyResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TallyResult<T>> + Send + 'static,
    {
        self.get_or_load_read(key, loader, options)
            .await
            .map(CacheRead::into_value)
    }

    /// Like [`get_or_load`](Self::get_or_load) with options taken from the
    /// configured TTL policy for `key`.
    pub async fn get_or_load_with_policy<T, F, Fut>(&self, key: &str, loader: F) -> TallyResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TallyResult<T>> + Send + 'static,
    {
        let options = self.inner.config.options_for(key);
        self.get_or_load(key, loader, options).await
    }

    /// Like [`get_or_load`](Self::get_or_load), also reporting where the value
    /// came from and how old it is.
    pub async fn get_or_load_read<T, F, Fut>(
        &self,
        key: &str,
        loader: F,
        options: CacheOptions,
    ) -> TallyResult<CacheRead<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TallyResult<T>> + Send + 'static,
    {
        let mut spawn = None;
        let plan = {
            let mut state = self.inner.lock()?;
            let now = Instant::now();
            let cached = state
                .entries
                .get(key)
                .map(|entry| (Arc::clone(&entry.data), entry.stored_at, entry.age(now)));
            let loading = state.in_flight.get(key).map(|load| load.future.clone());

            match (cached, loading) {
                (Some((data, stored_at, age)), None) if age < options.ttl => Plan::Ready {
                    data,
                    stored_at,
                    source: ReadSource::Fresh,
                },
                (Some((data, stored_at, _)), None) if options.stale_while_revalidate => {
                    let kind = LoadKind::Revalidate {
                        stale: Arc::clone(&data),
                    };
                    spawn = Some(self.start_load(&mut state, key, loader, kind));
                    Plan::Ready {
                        data,
                        stored_at,
                        source: ReadSource::Stale,
                    }
                }
                (_, Some(future)) => Plan::Await {
                    future,
                    source: ReadSource::Coalesced,
                },
                (_, None) => {
                    let future = self.start_load(&mut state, key, loader, LoadKind::Foreground);
                    spawn = Some(future.clone());
                    Plan::Await {
                        future,
                        source: ReadSource::Loaded,
                    }
                }
            }
        };

        if let Some(future) = spawn {
            tokio::spawn(future);
        }

        let metrics = &self.inner.metrics;
        match plan {
            Plan::Ready {
                data,
                stored_at,
                source,
            } => {
                if source == ReadSource::Stale {
                    CacheMetrics::incr(&metrics.stale_hits);
                    tracing::debug!(key = %key, "Serving stale entry, revalidating");
                } else {
                    CacheMetrics::incr(&metrics.hits);
                }
                Ok(CacheRead::new(downcast(key, &data)?, stored_at, source))
            }
            Plan::Await { future, source } => {
                if source == ReadSource::Coalesced {
                    CacheMetrics::incr(&metrics.coalesced);
                } else {
                    CacheMetrics::incr(&metrics.misses);
                }
                let data = future.await?;
                Ok(CacheRead::new(downcast(key, &data)?, Instant::now(), source))
            }
        }
    }

    /// Register a load for `key`. The caller spawns the returned future once
    /// the state lock is released.
    fn start_load<T, F, Fut>(
        &self,
        state: &mut CacheState,
        key: &str,
        loader: F,
        kind: LoadKind,
    ) -> InFlight
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TallyResult<T>> + Send + 'static,
    {
        let id = self.inner.next_load_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();

        let future = async move {
            let result = match AssertUnwindSafe(async move { loader().await })
                .catch_unwind()
                .await
            {
                Ok(result) => result.map(|value| Arc::new(value) as AnyValue),
                Err(payload) => {
                    let reason = panic_message(payload.as_ref());
                    tracing::error!(key = %owned_key, panic = %reason, "Cache loader panicked");
                    Err(TallyError::load_failed(
                        owned_key.as_str(),
                        format!("loader panicked: {}", reason),
                    ))
                }
            };
            inner.finish_load(&owned_key, id, result, kind)
        }
        .boxed()
        .shared();

        state.in_flight.insert(
            key.to_string(),
            Load {
                id,
                future: future.clone(),
            },
        );
        future
    }

    /// Remove one entry. A load already in flight for `key` still writes its
    /// result when it completes.
    pub fn invalidate(&self, key: &str) -> TallyResult<bool> {
        Ok(self.inner.lock()?.entries.remove(key).is_some())
    }

    /// Remove every entry whose key starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> TallyResult<usize> {
        let mut state = self.inner.lock()?;
        let before = state.entries.len();
        state.entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - state.entries.len())
    }

    /// Remove every entry. In-flight loads are unaffected.
    pub fn clear(&self) -> TallyResult<usize> {
        let mut state = self.inner.lock()?;
        let removed = state.entries.len();
        state.entries.clear();
        Ok(removed)
    }

    /// Unconditionally store `data` under `key` with a fresh timestamp.
    pub fn update_cache<T>(&self, key: &str, data: T) -> TallyResult<()>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.inner
            .lock()?
            .entries
            .insert(key.to_string(), CacheEntry::new(Arc::new(data)));
        Ok(())
    }

    /// Copy of the cached value for `key`, fresh or not, without loading.
    pub fn peek<T>(&self, key: &str) -> TallyResult<Option<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let data = self
            .inner
            .lock()?
            .entries
            .get(key)
            .map(|entry| Arc::clone(&entry.data));
        data.map(|data| downcast(key, &data)).transpose()
    }

    /// Whether a load for `key` is in flight.
    pub fn is_loading(&self, key: &str) -> TallyResult<bool> {
        Ok(self.inner.lock()?.in_flight.contains_key(key))
    }

    /// Remove entries older than `max_age`. Keys being loaded are skipped.
    pub fn sweep_expired(&self, max_age: Duration) -> TallyResult<usize> {
        let now = Instant::now();
        let mut state = self.inner.lock()?;
        let CacheState { entries, in_flight } = &mut *state;
        let before = entries.len();
        entries.retain(|key, entry| in_flight.contains_key(key) || entry.age(now) < max_age);
        let swept = before - entries.len();
        self.inner
            .metrics
            .swept
            .fetch_add(swept as u64, Ordering::Relaxed);
        Ok(swept)
    }

    /// Current contents and counters.
    pub fn stats(&self) -> TallyResult<CacheStats> {
        let state = self.inner.lock()?;
        let mut keys: Vec<String> = state.entries.keys().cloned().collect();
        let mut loading_keys: Vec<String> = state.in_flight.keys().cloned().collect();
        keys.sort();
        loading_keys.sort();

        Ok(CacheStats {
            size: keys.len(),
            keys,
            loading_keys,
            metrics: self.inner.metrics.snapshot(),
        })
    }

    pub fn metrics(&self) -> CacheMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Degraded once more than half of the background refreshes failed.
    pub fn health(&self) -> HealthCheck {
        let stats = match self.stats() {
            Ok(stats) => stats,
            Err(e) => return HealthCheck::unhealthy(COMPONENT, e.to_string()),
        };
        let metrics = stats.metrics;

        let check = if metrics.stale_hits > 0
            && metrics.revalidation_failures * 2 > metrics.stale_hits
        {
            HealthCheck::degraded(
                COMPONENT,
                format!(
                    "{} of {} background refreshes failed",
                    metrics.revalidation_failures, metrics.stale_hits
                ),
            )
        } else {
            HealthCheck::healthy(COMPONENT)
        };

        check
            .with_metadata("size", serde_json::json!(stats.size))
            .with_metadata("loading", serde_json::json!(stats.loading_keys.len()))
            .with_metadata("hit_rate", serde_json::json!(metrics.hit_rate()))
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("config", &self.inner.config)
            .field("metrics", &self.inner.metrics.snapshot())
            .finish()
    }
}
