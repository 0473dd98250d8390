//! Schedulable entities as the scheduler and strategies see them.

use std::fmt;

/// Stable identity of one schedulable entity for the lifetime of an
/// iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution status of a schedulable entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    /// Runnable; a candidate at the next scheduling point.
    Enabled,
    /// Waiting for an event that no pending operation has produced yet.
    BlockedOnEvent,
    /// Inside a nondeterministic boolean/integer choice.
    BlockedOnChoice,
    /// Finished; never scheduled again.
    Completed,
}

/// The kind of operation an entity will perform when next scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Send,
    Receive,
    Start,
    Stop,
}

/// An entity's next pending operation, with the correlation data strategies
/// need to relate causally-dependent operations (the created entity of a
/// create, the matching send of a receive).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    /// Entity acted upon, for Create and Send.
    pub target: Option<EntityId>,
    /// Correlates a Receive with the send that satisfies it.
    pub match_index: Option<u64>,
}

impl Operation {
    pub fn start() -> Self {
        Operation {
            kind: OperationKind::Start,
            target: None,
            match_index: None,
        }
    }

    pub fn create(target: EntityId) -> Self {
        Operation {
            kind: OperationKind::Create,
            target: Some(target),
            match_index: None,
        }
    }

    pub fn send(target: EntityId, match_index: u64) -> Self {
        Operation {
            kind: OperationKind::Send,
            target: Some(target),
            match_index: Some(match_index),
        }
    }

    pub fn receive(match_index: u64) -> Self {
        Operation {
            kind: OperationKind::Receive,
            target: None,
            match_index: Some(match_index),
        }
    }

    pub fn stop() -> Self {
        Operation {
            kind: OperationKind::Stop,
            target: None,
            match_index: None,
        }
    }
}

/// Immutable per-step view of an entity, handed to strategies at each
/// scheduling point. Ordered by id so deterministic strategies see a stable
/// candidate ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySnapshot {
    pub id: EntityId,
    pub status: EntityStatus,
    pub operation: Operation,
    /// How many operations this entity has already executed; `(id, op_index)`
    /// names the pending operation uniquely across the iteration.
    pub op_index: u64,
}

impl EntitySnapshot {
    pub fn is_enabled(&self) -> bool {
        self.status == EntityStatus::Enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_ids_order_by_value() {
        let mut ids = vec![EntityId(3), EntityId(1), EntityId(2)];
        ids.sort();
        assert_eq!(ids, vec![EntityId(1), EntityId(2), EntityId(3)]);
    }

    #[test]
    fn test_operation_correlation_data() {
        let send = Operation::send(EntityId(4), 7);
        assert_eq!(send.target, Some(EntityId(4)));
        assert_eq!(send.match_index, Some(7));

        let receive = Operation::receive(7);
        assert_eq!(receive.match_index, send.match_index);
        assert_eq!(receive.target, None);
    }

    #[test]
    fn test_snapshot_enabled() {
        let snapshot = EntitySnapshot {
            id: EntityId(0),
            status: EntityStatus::BlockedOnEvent,
            operation: Operation::receive(0),
            op_index: 2,
        };
        assert!(!snapshot.is_enabled());
    }
}
