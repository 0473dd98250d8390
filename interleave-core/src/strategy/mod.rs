//! Pluggable scheduling strategies.
//!
//! Every strategy answers the same three questions (which entity runs next,
//! what does a nondeterministic boolean/integer choice resolve to) and
//! manages its own private search state across iterations.

use crate::entity::{EntityId, EntitySnapshot};
use thiserror::Error;

mod bounding;
mod dfs;
mod pct;
mod pctcp;
mod random;
mod replay;

pub use bounding::{DelayBoundingStrategy, OperationBoundingStrategy};
pub use dfs::{DfsStrategy, IterativeDeepeningDfsStrategy};
pub use pct::PctStrategy;
pub use pctcp::PctcpStrategy;
pub use random::{ProbabilisticRandomStrategy, RandomStrategy};
pub use replay::ReplayStrategy;

/// A recorded decision could not be matched against the live execution.
/// Only the replay strategy produces this; it indicates non-reproducibility,
/// not a confirmed bug in the system under test.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("trace is not reproducible: {message}")]
pub struct Divergence {
    pub message: String,
}

impl Divergence {
    pub fn new(message: impl Into<String>) -> Self {
        Divergence {
            message: message.into(),
        }
    }
}

/// Shared contract of every scheduling strategy.
///
/// `next_entity` returning `Ok(None)` means the strategy has no continuation
/// to offer (no enabled candidate, or its search space at this point is
/// exhausted); the scheduler then decides between normal termination and
/// deadlock. `Err` is reserved for replay divergence.
pub trait Strategy: Send {
    /// Choose the next entity to run among `candidates` (ordered by id).
    fn next_entity(
        &mut self,
        candidates: &[EntitySnapshot],
        current: EntityId,
    ) -> Result<Option<EntityId>, Divergence>;

    /// Resolve a nondeterministic boolean choice; true with probability
    /// roughly 1 in `max_value` for randomized strategies. `Ok(None)` means
    /// the choice point is exhausted.
    fn next_bool(&mut self, max_value: u64) -> Result<Option<bool>, Divergence>;

    /// Resolve a nondeterministic integer choice in [0, max_value).
    fn next_int(&mut self, max_value: u64) -> Result<Option<u64>, Divergence>;

    /// Record an externally-imposed scheduling decision so step counting and
    /// internal bookkeeping stay consistent with the actual execution.
    fn force_next(&mut self, next: EntityId, candidates: &[EntitySnapshot], current: EntityId);

    /// Record an externally-imposed boolean choice.
    fn force_next_bool(&mut self, next: bool);

    /// Record an externally-imposed integer choice.
    fn force_next_int(&mut self, next: u64);

    /// Advance to the next iteration. Returns false when the strategy has
    /// nothing left to explore.
    fn prepare_for_next_iteration(&mut self) -> bool;

    /// Discard all search state.
    fn reset(&mut self);

    /// Decisions made so far in the current iteration.
    fn scheduled_steps(&self) -> usize;

    /// Whether the per-iteration step bound has been hit.
    fn has_reached_max_steps(&self) -> bool;

    /// Whether the strategy is fair (no entity starves forever in
    /// expectation).
    fn is_fair(&self) -> bool;

    /// Human-readable description for reports.
    fn description(&self) -> String;
}

/// Enabled candidates, preserving the by-id ordering of the input.
pub(crate) fn enabled(candidates: &[EntitySnapshot]) -> Vec<&EntitySnapshot> {
    candidates.iter().filter(|c| c.is_enabled()).collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::entity::{EntityId, EntitySnapshot, EntityStatus, Operation};

    /// Snapshot list where every listed entity is enabled on a Send.
    pub fn all_enabled(ids: &[u64]) -> Vec<EntitySnapshot> {
        ids.iter()
            .map(|&id| EntitySnapshot {
                id: EntityId(id),
                status: EntityStatus::Enabled,
                operation: Operation::send(EntityId(id), 0),
                op_index: 0,
            })
            .collect()
    }

    /// Snapshot list where the given ids are blocked waiting for an event.
    pub fn with_blocked(enabled: &[u64], blocked: &[u64]) -> Vec<EntitySnapshot> {
        let mut snapshots = all_enabled(enabled);
        for &id in blocked {
            snapshots.push(EntitySnapshot {
                id: EntityId(id),
                status: EntityStatus::BlockedOnEvent,
                operation: Operation::receive(0),
                op_index: 0,
            });
        }
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }
}
