//! Cache Sweeper Background Task
//!
//! Periodically removes entries that have not been refreshed for
//! `CacheConfig::evict_after`. Stale-while-revalidate keeps serving expired
//! entries indefinitely, so without the sweeper a cache with many one-off
//! keys only grows.
//!
//! # Example
//!
//! ```ignore
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let handle = spawn_sweeper(cache.clone(), shutdown_rx);
//!
//! // Later, trigger shutdown
//! let _ = shutdown_tx.send(true);
//! let swept = handle.await?;
//! ```

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::store::CacheStore;

/// Run the sweeper until the shutdown signal is received or its sender is
/// dropped. Returns the number of entries removed over the task's lifetime.
///
/// The sweep period comes from the store's configuration, which
/// [`CacheStore::new`] has already validated as non-zero.
pub async fn cache_sweeper_task(store: CacheStore, mut shutdown_rx: watch::Receiver<bool>) -> u64 {
    let sweep_interval = store.config().sweep_interval;
    let evict_after = store.config().evict_after;

    let mut ticker = interval(sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; nothing can be expired yet.
    ticker.tick().await;

    tracing::info!(
        sweep_interval_ms = sweep_interval.as_millis() as u64,
        evict_after_ms = evict_after.as_millis() as u64,
        "Cache sweeper started"
    );

    let mut total = 0u64;
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Cache sweeper shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                match store.sweep_expired(evict_after) {
                    Ok(0) => tracing::trace!("Cache sweep found nothing to evict"),
                    Ok(swept) => {
                        total += swept as u64;
                        tracing::debug!(swept, "Cache sweep evicted expired entries");
                    }
                    Err(e) => tracing::error!(error = %e, "Cache sweep failed"),
                }
            }
        }
    }

    tracing::info!(swept = total, "Cache sweeper completed");
    total
}

/// Spawn [`cache_sweeper_task`] on the current runtime.
pub fn spawn_sweeper(store: CacheStore, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<u64> {
    tokio::spawn(cache_sweeper_task(store, shutdown_rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tally_core::{CacheConfig, ConfigError, TallyError};

    fn store() -> CacheStore {
        CacheStore::new(
            CacheConfig::new()
                .with_sweep_interval(Duration::from_secs(10))
                .with_evict_after(Duration::from_secs(30)),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_old_entries() {
        let cache = store();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_sweeper(cache.clone(), shutdown_rx);

        cache.update_cache("old", 1u32).unwrap();
        tokio::time::sleep(Duration::from_secs(25)).await;
        cache.update_cache("recent", 2u32).unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(cache.peek::<u32>("old").unwrap(), None);
        assert_eq!(cache.peek::<u32>("recent").unwrap(), Some(2));

        shutdown_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), 1);
        assert_eq!(cache.metrics().swept, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_when_sender_dropped() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = spawn_sweeper(store(), shutdown_rx);

        tokio::time::sleep(Duration::from_secs(15)).await;
        drop(shutdown_tx);

        assert_eq!(handle.await.unwrap(), 0);
    }

    #[test]
    fn test_zero_sweep_interval_is_rejected_before_spawn() {
        let config = CacheConfig::from_vars(|name| {
            (name == "TALLY_CACHE_SWEEP_INTERVAL_MS").then(|| "0".to_string())
        });
        assert!(config.sweep_interval.is_zero());

        match CacheStore::new(config) {
            Err(TallyError::Config(ConfigError::InvalidValue { field, .. })) => {
                assert_eq!(field, "sweep_interval")
            }
            other => panic!("expected invalid sweep interval, got {:?}", other),
        }
    }
}
