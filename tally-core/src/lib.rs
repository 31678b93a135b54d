//! Tally Core - Shared Types
//!
//! Error taxonomy, configuration, identity and health types used by every
//! other tally crate. No coordination logic lives here.

pub mod authority;
pub mod config;
pub mod error;
pub mod health;
pub mod identity;
pub mod telemetry;

pub use authority::{BalanceAuthority, BalanceChange};
pub use config::{
    CacheConfig, CacheOptions, TtlPolicy, UpdateQueueOptions, BALANCE_EPSILON,
    DEFAULT_CACHE_TTL_MS, DEFAULT_SWEEP_INTERVAL_MS, DEFAULT_SYNC_INTERVAL_MS,
    DEFAULT_SYNC_MAX_RETRIES,
};
pub use error::{
    CacheError, ConfigError, StorageError, SyncError, TallyError, TallyResult, ValidationError,
};
pub use health::{HealthCheck, HealthStatus};
pub use identity::EntityId;
pub use telemetry::{init_tracing, TelemetryConfig};

/// Returns true when two balances are equal for reconciliation purposes.
pub fn balances_match(a: f64, b: f64) -> bool {
    (a - b).abs() < BALANCE_EPSILON
}
