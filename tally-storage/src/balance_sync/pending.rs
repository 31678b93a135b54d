//! Pending-update bookkeeping: at most one update per entity.
//!
//! Pure state with no I/O. [`UpdateQueue`](super::UpdateQueue) wraps it in a
//! mutex and drives it from the drain loop.

use std::collections::HashMap;

use serde::Serialize;
use tally_core::{balances_match, EntityId};
use tokio::time::Instant;

/// A requested balance change waiting to be reconciled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingUpdate {
    pub entity_id: EntityId,
    pub target_value: f64,
    /// Label of the producer that asked for the change.
    pub source: String,
    #[serde(skip)]
    pub enqueued_at: Instant,
    /// Enqueue order, breaks ties between equal timestamps.
    pub seq: u64,
    /// Failed applications so far.
    pub attempts: u32,
}

/// What [`PendingUpdates::enqueue`] did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EnqueueOutcome {
    /// No update was pending for the entity.
    Queued,
    /// A pending update for the entity was replaced.
    Replaced { previous_target: f64 },
    /// The pending target already matches; nothing changed.
    DuplicateSuppressed,
}

impl EnqueueOutcome {
    pub fn accepted(&self) -> bool {
        !matches!(self, Self::DuplicateSuppressed)
    }
}

#[derive(Debug, Default)]
pub struct PendingUpdates {
    updates: HashMap<EntityId, PendingUpdate>,
    next_seq: u64,
}

impl PendingUpdates {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Store `target_value` for `entity_id`, replacing any pending update
    /// unless `prevent_duplicates` is set and the targets match.
    pub fn enqueue(
        &mut self,
        entity_id: EntityId,
        target_value: f64,
        source: String,
        now: Instant,
        prevent_duplicates: bool,
    ) -> EnqueueOutcome {
        if prevent_duplicates {
            if let Some(existing) = self.updates.get(&entity_id) {
                if balances_match(existing.target_value, target_value) {
                    return EnqueueOutcome::DuplicateSuppressed;
                }
            }
        }

        let update = PendingUpdate {
            entity_id,
            target_value,
            source,
            enqueued_at: now,
            seq: self.next_seq(),
            attempts: 0,
        };
        match self.updates.insert(entity_id, update) {
            Some(previous) => EnqueueOutcome::Replaced {
                previous_target: previous.target_value,
            },
            None => EnqueueOutcome::Queued,
        }
    }

    /// Put a failed update back with a new timestamp and one more attempt.
    ///
    /// Returns false, leaving the map unchanged, when a newer update for the
    /// same entity was enqueued in the meantime.
    pub fn requeue(&mut self, mut update: PendingUpdate, now: Instant) -> bool {
        if self.updates.contains_key(&update.entity_id) {
            return false;
        }
        update.attempts += 1;
        update.enqueued_at = now;
        update.seq = self.next_seq();
        self.updates.insert(update.entity_id, update);
        true
    }

    /// Remove every pending update, oldest first.
    pub fn take_all(&mut self) -> Vec<PendingUpdate> {
        let mut updates: Vec<PendingUpdate> = self.updates.drain().map(|(_, u)| u).collect();
        updates.sort_by_key(|u| (u.enqueued_at, u.seq));
        updates
    }

    /// Copy of every pending update, oldest first.
    pub fn snapshot(&self) -> Vec<PendingUpdate> {
        let mut updates: Vec<PendingUpdate> = self.updates.values().cloned().collect();
        updates.sort_by_key(|u| (u.enqueued_at, u.seq));
        updates
    }

    pub fn get(&self, entity_id: EntityId) -> Option<&PendingUpdate> {
        self.updates.get(&entity_id)
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Partition oldest-first updates by source.
///
/// Groups come out in the order their source first appears; each group keeps
/// the input order.
pub fn group_by_source(updates: Vec<PendingUpdate>) -> Vec<(String, Vec<PendingUpdate>)> {
    let mut groups: Vec<(String, Vec<PendingUpdate>)> = Vec::new();
    for update in updates {
        match groups.iter_mut().find(|(source, _)| *source == update.source) {
            Some((_, group)) => group.push(update),
            None => groups.push((update.source.clone(), vec![update])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(n: u64) -> EntityId {
        EntityId::new(n)
    }

    #[test]
    fn test_duplicate_target_is_suppressed() {
        let now = Instant::now();
        let mut pending = PendingUpdates::new();

        assert_eq!(
            pending.enqueue(id(7), 100.00, "A".into(), now, true),
            EnqueueOutcome::Queued
        );
        let outcome = pending.enqueue(id(7), 100.004, "A".into(), now, true);

        assert_eq!(outcome, EnqueueOutcome::DuplicateSuppressed);
        assert!(!outcome.accepted());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.get(id(7)).unwrap().target_value, 100.00);
    }

    #[test]
    fn test_duplicates_allowed_when_disabled() {
        let now = Instant::now();
        let mut pending = PendingUpdates::new();
        pending.enqueue(id(7), 100.00, "A".into(), now, false);

        let outcome = pending.enqueue(id(7), 100.004, "B".into(), now, false);

        assert_eq!(outcome, EnqueueOutcome::Replaced { previous_target: 100.00 });
        assert_eq!(pending.get(id(7)).unwrap().source, "B");
    }

    #[test]
    fn test_latest_target_wins() {
        let now = Instant::now();
        let mut pending = PendingUpdates::new();
        pending.enqueue(id(7), 100.00, "A".into(), now, true);

        let outcome = pending.enqueue(id(7), 150.00, "A".into(), now, true);

        assert!(outcome.accepted());
        let updates = pending.take_all();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].target_value, 150.00);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_requeue_never_replaces_newer_update() {
        let now = Instant::now();
        let mut pending = PendingUpdates::new();
        pending.enqueue(id(1), 10.0, "A".into(), now, true);
        let failed = pending.take_all().remove(0);

        pending.enqueue(id(1), 20.0, "A".into(), now, true);
        assert!(!pending.requeue(failed.clone(), now));
        assert_eq!(pending.get(id(1)).unwrap().target_value, 20.0);

        pending.take_all();
        assert!(pending.requeue(failed, now + Duration::from_millis(5)));
        let retried = pending.get(id(1)).unwrap();
        assert_eq!(retried.target_value, 10.0);
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.enqueued_at, now + Duration::from_millis(5));
    }

    #[test]
    fn test_take_all_orders_by_enqueue_time() {
        let start = Instant::now();
        let mut pending = PendingUpdates::new();
        pending.enqueue(id(3), 3.0, "A".into(), start + Duration::from_millis(20), true);
        pending.enqueue(id(1), 1.0, "A".into(), start, true);
        pending.enqueue(id(2), 2.0, "A".into(), start, true);

        let order: Vec<u64> = pending.take_all().iter().map(|u| u.entity_id.get()).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_group_by_source_keeps_first_appearance_order() {
        let start = Instant::now();
        let mut pending = PendingUpdates::new();
        pending.enqueue(id(1), 1.0, "payments".into(), start, true);
        pending.enqueue(id(2), 2.0, "journal".into(), start + Duration::from_millis(1), true);
        pending.enqueue(id(3), 3.0, "payments".into(), start + Duration::from_millis(2), true);

        let groups = group_by_source(pending.take_all());

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "payments");
        let payment_ids: Vec<u64> = groups[0].1.iter().map(|u| u.entity_id.get()).collect();
        assert_eq!(payment_ids, vec![1, 3]);
        assert_eq!(groups[1].0, "journal");
    }
}
