//! Shared in-memory cache with explicit freshness and load coalescing.
//!
//! Every read names a TTL and whether stale data may be served while a
//! background refresh runs. Concurrent reads of the same key share a single
//! loader invocation. Reads through [`CacheStore::get_or_load_read`] return
//! [`CacheRead<T>`], which says where the value came from and how old it is.
//!
//! # Example
//!
//! ```ignore
//! let cache = CacheStore::new(CacheConfig::from_env())?;
//!
//! // Serve from cache for 30s, then serve stale while refreshing.
//! let options = CacheOptions::new().with_ttl(Duration::from_secs(30));
//! let summary = cache.get_or_load("dashboard:summary", move || fetch_summary(), options).await?;
//!
//! // Several independent reads, one failure does not sink the others.
//! let loader = ParallelLoader::new(cache.clone());
//! let batch = loader.load_many(vec![("accounts", a), ("vendors", v)], options).await;
//! if batch.has_errors() {
//!     tracing::warn!(errors = ?batch.errors, "Partial dashboard");
//! }
//! ```

pub mod parallel;
pub mod read;
pub mod stats;
pub mod store;
pub mod sweeper;

pub use parallel::{BatchResult, ParallelLoader};
pub use read::{CacheRead, ReadSource};
pub use stats::{CacheMetrics, CacheMetricsSnapshot, CacheStats};
pub use store::CacheStore;
pub use sweeper::{cache_sweeper_task, spawn_sweeper};
