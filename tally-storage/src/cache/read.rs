//! Read results carrying how the value was obtained.

use std::time::Duration;
use tokio::time::Instant;

/// Where a cache read got its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadSource {
    /// A fresh entry; no loader ran.
    Fresh,
    /// A stale entry served while a background refresh runs.
    Stale,
    /// This call ran the loader.
    Loaded,
    /// This call awaited a load started by another caller.
    Coalesced,
}

/// Result of a cache read, carrying freshness metadata.
///
/// `stored_at` is when the value entered the cache, so `age()` of a stale
/// read tells the caller how old the data they are showing is.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    stored_at: Instant,
    source: ReadSource,
}

impl<T> CacheRead<T> {
    pub(crate) fn new(value: T, stored_at: Instant, source: ReadSource) -> Self {
        Self {
            value,
            stored_at,
            source,
        }
    }

    /// Consume the wrapper and return the underlying value.
    pub fn into_value(self) -> T {
        self.value
    }

    /// Get a reference to the underlying value.
    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn source(&self) -> ReadSource {
        self.source
    }

    /// Time since the value entered the cache.
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.stored_at)
    }

    /// True when the value came from an existing entry (fresh or stale).
    pub fn was_cache_hit(&self) -> bool {
        matches!(self.source, ReadSource::Fresh | ReadSource::Stale)
    }

    pub fn is_stale(&self) -> bool {
        self.source == ReadSource::Stale
    }

    /// Map the inner value to a new type.
    pub fn map<U, F>(self, f: F) -> CacheRead<U>
    where
        F: FnOnce(T) -> U,
    {
        CacheRead {
            value: f(self.value),
            stored_at: self.stored_at,
            source: self.source,
        }
    }
}

impl<T> AsRef<T> for CacheRead<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}
