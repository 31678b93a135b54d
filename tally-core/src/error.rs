//! Error types for tally operations

use crate::EntityId;
use thiserror::Error;

/// Cache layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Load failed for key {key}: {reason}")]
    LoadFailed { key: String, reason: String },

    #[error("Cached value for key {key} is not a {expected}")]
    TypeMismatch { key: String, expected: &'static str },
}

/// Balance reconciliation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Fetching current value of entity {entity_id} failed: {reason}")]
    FetchFailed { entity_id: EntityId, reason: String },

    #[error("Applying update to entity {entity_id} failed: {reason}")]
    ApplyFailed { entity_id: EntityId, reason: String },

    #[error("Authority panicked while reconciling entity {entity_id}: {reason}")]
    AuthorityPanicked { entity_id: EntityId, reason: String },
}

/// In-memory storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Telemetry already initialised: {reason}")]
    TelemetryInit { reason: String },
}

/// Master error type for all tally errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TallyError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl TallyError {
    /// Build a `CacheError::LoadFailed` for a loader that failed with an
    /// arbitrary error.
    pub fn load_failed(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Cache(CacheError::LoadFailed {
            key: key.into(),
            reason: reason.to_string(),
        })
    }
}

/// Result type alias for tally operations.
pub type TallyResult<T> = Result<T, TallyError>;

// =============================================================================
// TESTS
// =============================================================================
