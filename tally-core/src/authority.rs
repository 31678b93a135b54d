//! The external system that owns entity balances.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{EntityId, TallyResult};

/// A balance change handed to [`BalanceAuthority::apply_update`].
///
/// `old_value` is the authoritative value read immediately before the write;
/// it is never known at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceChange {
    pub entity_id: EntityId,
    pub old_value: f64,
    pub new_value: f64,
    pub source: String,
}

impl BalanceChange {
    /// Signed difference the change applies.
    pub fn delta(&self) -> f64 {
        self.new_value - self.old_value
    }
}

/// Authoritative store for entity balances (typically an authenticated HTTP
/// API).
///
/// Implementations may fail on either call; the update queue treats any
/// failure as retryable.
#[async_trait]
pub trait BalanceAuthority: Send + Sync {
    /// Read the current authoritative value of an entity.
    async fn fetch_current_value(&self, entity_id: EntityId) -> TallyResult<f64>;

    /// Persist a new value for an entity.
    async fn apply_update(&self, change: &BalanceChange) -> TallyResult<()>;
}

#[async_trait]
impl<A: BalanceAuthority + ?Sized> BalanceAuthority for std::sync::Arc<A> {
    async fn fetch_current_value(&self, entity_id: EntityId) -> TallyResult<f64> {
        (**self).fetch_current_value(entity_id).await
    }

    async fn apply_update(&self, change: &BalanceChange) -> TallyResult<()> {
        (**self).apply_update(change).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_change_delta() {
        let change = BalanceChange {
            entity_id: EntityId::new(7),
            old_value: 100.0,
            new_value: 150.0,
            source: "journal".to_string(),
        };
        assert!((change.delta() - 50.0).abs() < f64::EPSILON);
    }
}
