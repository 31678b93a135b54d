//! Configuration types
//!
//! Every struct here has sensible defaults, `with_*` builders, a `from_env()`
//! constructor and a `validate()` check. Environment variables use the
//! `TALLY_` prefix.

use crate::{ConfigError, TallyError, TallyResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// DEFAULTS
// ============================================================================

/// Default freshness window for cached data (5 minutes).
pub const DEFAULT_CACHE_TTL_MS: u64 = 300_000;

/// Default delay between drain cycles of the update queue.
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 1_000;

/// Default number of re-enqueues before a failing update is abandoned.
pub const DEFAULT_SYNC_MAX_RETRIES: u32 = 3;

/// Default interval of the cache expiry sweeper.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;

/// Two target values closer than this are considered the same balance.
pub const BALANCE_EPSILON: f64 = 0.01;

fn invalid(field: &str, value: impl std::fmt::Debug, reason: &str) -> TallyError {
    TallyError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: format!("{:?}", value),
        reason: reason.to_string(),
    })
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

// ============================================================================
// CACHE OPTIONS
// ============================================================================

/// Per-call cache options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOptions {
    /// How long a loaded value counts as fresh.
    pub ttl: Duration,
    /// Serve stale data immediately and refresh it in the background.
    pub stale_while_revalidate: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(DEFAULT_CACHE_TTL_MS),
            stale_while_revalidate: true,
        }
    }
}

impl CacheOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Enable or disable stale-while-revalidate.
    pub fn with_stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.stale_while_revalidate = enabled;
        self
    }

    /// Validate the options.
    pub fn validate(&self) -> TallyResult<()> {
        if self.ttl.is_zero() {
            return Err(invalid("ttl", self.ttl, "ttl must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// TTL POLICY
// ============================================================================

/// Prefix-based TTL rules.
///
/// Keys are matched against the rules in insertion order; the first rule whose
/// prefix the key starts with decides the TTL. Keys matching no rule get
/// `default_ttl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlPolicy {
    rules: Vec<(String, Duration)>,
    default_ttl: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_CACHE_TTL_MS))
    }
}

impl TtlPolicy {
    /// A policy with no rules.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            rules: Vec::new(),
            default_ttl,
        }
    }

    /// TTLs tuned for financial report data: the more volatile the report,
    /// the shorter the window.
    pub fn financial_reports() -> Self {
        const MIN: u64 = 60;
        Self::new(Duration::from_secs(10 * MIN))
            .with_rule("balance-sheet", Duration::from_secs(15 * MIN))
            .with_rule("profit-loss", Duration::from_secs(10 * MIN))
            .with_rule("cash-flow", Duration::from_secs(10 * MIN))
            .with_rule("trial-balance", Duration::from_secs(20 * MIN))
            .with_rule("general-ledger-all", Duration::from_secs(8 * MIN))
            .with_rule("general-ledger", Duration::from_secs(5 * MIN))
            .with_rule("sales-summary", Duration::from_secs(12 * MIN))
            .with_rule("vendor-analysis", Duration::from_secs(15 * MIN))
            .with_rule("journal-entry-analysis", Duration::from_secs(8 * MIN))
            .with_rule("financial-dashboard", Duration::from_secs(5 * MIN))
    }

    /// Append a rule.
    pub fn with_rule(mut self, prefix: impl Into<String>, ttl: Duration) -> Self {
        self.rules.push((prefix.into(), ttl));
        self
    }

    /// The TTL for keys that match no rule.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Resolve the TTL for `key`.
    pub fn ttl_for(&self, key: &str) -> Duration {
        self.rules
            .iter()
            .find(|(prefix, _)| key.starts_with(prefix.as_str()))
            .map(|(_, ttl)| *ttl)
            .unwrap_or(self.default_ttl)
    }

    /// Validate every rule and the default.
    pub fn validate(&self) -> TallyResult<()> {
        if self.default_ttl.is_zero() {
            return Err(invalid("default_ttl", self.default_ttl, "ttl must be positive"));
        }
        for (prefix, ttl) in &self.rules {
            if prefix.is_empty() {
                return Err(invalid("ttl_policy", prefix, "rule prefix must not be empty"));
            }
            if ttl.is_zero() {
                return Err(invalid(prefix, ttl, "ttl must be positive"));
            }
        }
        Ok(())
    }
}

// ============================================================================
// CACHE CONFIG
// ============================================================================

/// Store-wide cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Options used by policy-driven reads (`ttl` is overridden per key).
    pub default_options: CacheOptions,
    /// Per-prefix TTLs.
    pub ttl_policy: TtlPolicy,
    /// How often the expiry sweeper runs.
    pub sweep_interval: Duration,
    /// Entries not refreshed for this long are removed by the sweeper.
    pub evict_after: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let default_options = CacheOptions::default();
        Self {
            default_options,
            ttl_policy: TtlPolicy::new(default_options.ttl),
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
            evict_after: default_options.ttl * 2,
        }
    }
}

impl CacheConfig {
    /// Create a new cache config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TTL policy.
    pub fn with_ttl_policy(mut self, policy: TtlPolicy) -> Self {
        self.ttl_policy = policy;
        self
    }

    /// Enable or disable stale-while-revalidate for policy-driven reads.
    pub fn with_stale_while_revalidate(mut self, enabled: bool) -> Self {
        self.default_options.stale_while_revalidate = enabled;
        self
    }

    /// Set the sweeper interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the eviction age.
    pub fn with_evict_after(mut self, age: Duration) -> Self {
        self.evict_after = age;
        self
    }

    /// Resolve the options a policy-driven read of `key` uses.
    pub fn options_for(&self, key: &str) -> CacheOptions {
        self.default_options.with_ttl(self.ttl_policy.ttl_for(key))
    }

    /// Create CacheConfig from environment variables.
    ///
    /// Environment variables:
    /// - `TALLY_CACHE_TTL_MS`: Default TTL (default: 300000)
    /// - `TALLY_CACHE_SWR`: "true" or "false" (default: true)
    /// - `TALLY_CACHE_SWEEP_INTERVAL_MS`: Sweeper interval (default: 60000)
    /// - `TALLY_CACHE_EVICT_AFTER_MS`: Eviction age (default: 2 x TTL)
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let ttl = var("TALLY_CACHE_TTL_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_CACHE_TTL_MS));

        let stale_while_revalidate = var("TALLY_CACHE_SWR")
            .and_then(|s| parse_bool(&s))
            .unwrap_or(true);

        let sweep_interval = var("TALLY_CACHE_SWEEP_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS));

        let evict_after = var("TALLY_CACHE_EVICT_AFTER_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(ttl * 2);

        Self {
            default_options: CacheOptions {
                ttl,
                stale_while_revalidate,
            },
            ttl_policy: TtlPolicy::new(ttl),
            sweep_interval,
            evict_after,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> TallyResult<()> {
        self.default_options.validate()?;
        self.ttl_policy.validate()?;
        if self.sweep_interval.is_zero() {
            return Err(invalid(
                "sweep_interval",
                self.sweep_interval,
                "sweep_interval must be positive",
            ));
        }
        if self.evict_after.is_zero() {
            return Err(invalid("evict_after", self.evict_after, "evict_after must be positive"));
        }
        Ok(())
    }
}

// ============================================================================
// UPDATE QUEUE OPTIONS
// ============================================================================

/// Configuration for the balance update queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateQueueOptions {
    /// Reject enqueues whose target is within [`BALANCE_EPSILON`] of the
    /// already-queued target for the same entity.
    pub prevent_duplicates: bool,
    /// How many times a failed update is re-enqueued before it is abandoned.
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    /// Delay before a follow-up drain cycle.
    pub sync_interval: Duration,
}

impl Default for UpdateQueueOptions {
    fn default() -> Self {
        Self {
            prevent_duplicates: true,
            max_retries: Some(DEFAULT_SYNC_MAX_RETRIES),
            sync_interval: Duration::from_millis(DEFAULT_SYNC_INTERVAL_MS),
        }
    }
}

impl UpdateQueueOptions {
    /// Create options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable duplicate suppression.
    pub fn with_prevent_duplicates(mut self, enabled: bool) -> Self {
        self.prevent_duplicates = enabled;
        self
    }

    /// Bound the number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Retry failed updates forever.
    pub fn with_unbounded_retries(mut self) -> Self {
        self.max_retries = None;
        self
    }

    /// Set the delay between drain cycles.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Create UpdateQueueOptions from environment variables.
    ///
    /// Environment variables:
    /// - `TALLY_SYNC_PREVENT_DUPLICATES`: "true" or "false" (default: true)
    /// - `TALLY_SYNC_MAX_RETRIES`: integer or "unbounded" (default: 3)
    /// - `TALLY_SYNC_INTERVAL_MS`: Drain cycle delay (default: 1000)
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Build options from an arbitrary variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let prevent_duplicates = var("TALLY_SYNC_PREVENT_DUPLICATES")
            .and_then(|s| parse_bool(&s))
            .unwrap_or(true);

        let max_retries = match var("TALLY_SYNC_MAX_RETRIES") {
            Some(raw) if raw.trim().eq_ignore_ascii_case("unbounded") => None,
            Some(raw) => Some(raw.trim().parse().unwrap_or(DEFAULT_SYNC_MAX_RETRIES)),
            None => Some(DEFAULT_SYNC_MAX_RETRIES),
        };

        let sync_interval = var("TALLY_SYNC_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_SYNC_INTERVAL_MS));

        Self {
            prevent_duplicates,
            max_retries,
            sync_interval,
        }
    }

    /// Validate the options.
    pub fn validate(&self) -> TallyResult<()> {
        if self.sync_interval.is_zero() {
            return Err(invalid(
                "sync_interval",
                self.sync_interval,
                "sync_interval must be positive",
            ));
        }
        Ok(())
    }
}
