//! Concurrent multi-key loading through the cache.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use tally_core::{CacheOptions, TallyResult};

use super::store::CacheStore;

/// Outcome of [`ParallelLoader::load_many`].
///
/// Every requested name lands in exactly one of the two maps.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult<T> {
    pub data: HashMap<String, T>,
    /// Error message per failed name.
    pub errors: HashMap<String, String>,
}

impl<T> BatchResult<T> {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Number of names that loaded successfully.
    pub fn loaded(&self) -> usize {
        self.data.len()
    }
}

impl<T> Default for BatchResult<T> {
    fn default() -> Self {
        Self {
            data: HashMap::new(),
            errors: HashMap::new(),
        }
    }
}

/// Releases a batch's loading flags when dropped, including when the batch
/// future is cancelled before it settles.
struct LoadingGuard<'a> {
    loading: &'a Mutex<HashMap<String, usize>>,
    names: Vec<String>,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut loading) = self.loading.lock() {
            for name in &self.names {
                if let Some(count) = loading.get_mut(name) {
                    *count -= 1;
                    if *count == 0 {
                        loading.remove(name);
                    }
                }
            }
        }
    }
}

/// Runs several named loads at once, each through the shared [`CacheStore`].
///
/// One failing loader never affects the others. While a batch runs, each of
/// its names reports as loading. Dropping the batch clears those flags but
/// leaves the underlying cache loads running.
#[derive(Debug, Clone)]
pub struct ParallelLoader {
    cache: CacheStore,
    loading: Arc<Mutex<HashMap<String, usize>>>,
}

impl ParallelLoader {
    pub fn new(cache: CacheStore) -> Self {
        Self {
            cache,
            loading: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Load every `(name, loader)` pair concurrently and settle all of them.
    pub async fn load_many<T, K, F, Fut, I>(&self, loaders: I, options: CacheOptions) -> BatchResult<T>
    where
        T: Clone + Send + Sync + 'static,
        K: Into<String>,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TallyResult<T>> + Send + 'static,
        I: IntoIterator<Item = (K, F)>,
    {
        let loaders: Vec<(String, F)> = loaders
            .into_iter()
            .map(|(name, loader)| (name.into(), loader))
            .collect();
        let names: Vec<String> = loaders.iter().map(|(name, _)| name.clone()).collect();

        let guard = self.mark_loading(names);
        let settled = join_all(loaders.into_iter().map(|(name, loader)| async move {
            let result = self.cache.get_or_load(&name, loader, options).await;
            (name, result)
        }))
        .await;
        drop(guard);

        let mut batch = BatchResult::default();
        for (name, result) in settled {
            match result {
                Ok(value) => {
                    batch.data.insert(name, value);
                }
                Err(e) => {
                    tracing::debug!(name = %name, error = %e, "Batch load failed");
                    batch.errors.insert(name, e.to_string());
                }
            }
        }

        if batch.has_errors() {
            tracing::warn!(
                loaded = batch.loaded(),
                failed = batch.errors.len(),
                "Batch load finished with errors"
            );
        }
        batch
    }

    /// Whether `name` belongs to a batch still in progress.
    pub fn is_loading(&self, name: &str) -> bool {
        self.loading
            .lock()
            .map(|loading| loading.contains_key(name))
            .unwrap_or(false)
    }

    /// Names of every batch member still in progress, sorted.
    pub fn loading_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .loading
            .lock()
            .map(|loading| loading.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    // Overlapping batches may share names, so each name is reference counted.
    fn mark_loading(&self, names: Vec<String>) -> LoadingGuard<'_> {
        if let Ok(mut loading) = self.loading.lock() {
            for name in &names {
                *loading.entry(name.clone()).or_insert(0) += 1;
            }
        }
        LoadingGuard {
            loading: &self.loading,
            names,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::{BoxFuture, FutureExt};
    use std::time::Duration;
    use tally_core::TallyError;

    type Loader = Box<dyn FnOnce() -> BoxFuture<'static, TallyResult<u32>> + Send>;

    fn ok_after(value: u32, delay: Duration) -> Loader {
        Box::new(move || {
            async move {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            .boxed()
        })
    }

    fn err_after(delay: Duration) -> Loader {
        Box::new(move || {
            async move {
                tokio::time::sleep(delay).await;
                Err(TallyError::load_failed("vendors", "502 bad gateway"))
            }
            .boxed()
        })
    }

    fn explode() -> TallyResult<u32> {
        panic!("vendor feed bug")
    }

    fn panics() -> Loader {
        Box::new(|| async { explode() }.boxed())
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_many_isolates_failures() {
        let loader = ParallelLoader::new(CacheStore::with_defaults());

        let batch = loader
            .load_many(
                vec![
                    ("accounts", ok_after(1, Duration::from_millis(10))),
                    ("vendors", err_after(Duration::from_millis(5))),
                    ("customers", ok_after(3, Duration::from_millis(20))),
                ],
                CacheOptions::default(),
            )
            .await;

        assert!(batch.has_errors());
        assert_eq!(batch.loaded(), 2);
        assert_eq!(batch.data["accounts"], 1);
        assert_eq!(batch.data["customers"], 3);
        assert!(batch.errors["vendors"].contains("502 bad gateway"));
        assert!(!batch.data.contains_key("vendors"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_many_runs_loaders_concurrently() {
        let loader = ParallelLoader::new(CacheStore::with_defaults());
        let start = tokio::time::Instant::now();

        let batch = loader
            .load_many(
                (0..4).map(|i| (format!("report-{}", i), ok_after(i, Duration::from_millis(100)))),
                CacheOptions::default(),
            )
            .await;

        assert!(!batch.has_errors());
        assert_eq!(batch.loaded(), 4);
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loading_flags_clear_after_batch() {
        let loader = ParallelLoader::new(CacheStore::with_defaults());

        let running = {
            let loader = loader.clone();
            tokio::spawn(async move {
                loader
                    .load_many(
                        vec![
                            ("a", ok_after(1, Duration::from_millis(50))),
                            ("b", err_after(Duration::from_millis(10))),
                        ],
                        CacheOptions::default(),
                    )
                    .await
            })
        };
        tokio::task::yield_now().await;

        assert!(loader.is_loading("a"));
        assert_eq!(loader.loading_names(), vec!["a".to_string(), "b".to_string()]);

        // "b" has failed but stays flagged until the whole batch settles.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(loader.is_loading("b"));

        let batch = running.await.unwrap();
        assert_eq!(batch.errors.len(), 1);
        assert!(!loader.is_loading("a"));
        assert!(!loader.is_loading("b"));
        assert!(loader.loading_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_loader_lands_in_errors() {
        let loader = ParallelLoader::new(CacheStore::with_defaults());

        let batch = loader
            .load_many(
                vec![
                    ("accounts", ok_after(1, Duration::from_millis(10))),
                    ("vendors", panics()),
                ],
                CacheOptions::default(),
            )
            .await;

        assert_eq!(batch.data["accounts"], 1);
        assert!(batch.errors["vendors"].contains("vendor feed bug"));
        assert!(!loader.cache().is_loading("vendors").unwrap());
        assert!(loader.loading_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_batch_clears_loading_flags() {
        let loader = ParallelLoader::new(CacheStore::with_defaults());

        let batch = loader.load_many(
            vec![("accounts", ok_after(1, Duration::from_secs(10)))],
            CacheOptions::default(),
        );
        let timed_out = tokio::time::timeout(Duration::from_millis(10), batch).await;
        assert!(timed_out.is_err());

        assert!(!loader.is_loading("accounts"));
        assert!(loader.loading_names().is_empty());

        // The shared cache load keeps running and still fills the entry.
        assert!(loader.cache().is_loading("accounts").unwrap());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(loader.cache().peek::<u32>("accounts").unwrap(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_many_uses_cached_values() {
        let cache = CacheStore::with_defaults();
        cache.update_cache("accounts", 42u32).unwrap();
        let loader = ParallelLoader::new(cache);

        let batch = loader
            .load_many(
                vec![("accounts", ok_after(1, Duration::ZERO))],
                CacheOptions::default(),
            )
            .await;

        assert_eq!(batch.data["accounts"], 42);
    }
}
