//! Chain-partitioned priority-based probabilistic testing.
//!
//! Operations are grouped online into chains, sequences totally ordered by
//! causality (an entity's own program order, creator to created start,
//! send to matching receive). Priorities attach to whole chains instead of
//! entities, so interleavings that differ only in the order of causally
//! independent work are not explored twice.

use crate::entity::{EntityId, EntitySnapshot, OperationKind};
use crate::rng::{Seed, SplitMixRng};
use crate::strategy::{enabled, Divergence, Strategy};
use log::debug;
use std::collections::{BTreeSet, HashMap, HashSet};

/// One concrete operation: the `op_index`-th operation of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct OpRef {
    entity: EntityId,
    index: u64,
}

/// Online partition of observed operations into causally ordered chains.
#[derive(Debug, Default)]
struct ChainPartitioner {
    /// Chains in priority order; front is the highest priority.
    chains: Vec<Vec<OpRef>>,
    assigned: HashSet<OpRef>,
    executed: HashSet<OpRef>,
    /// Cross-entity causal predecessor (creator's create op for a start).
    cause: HashMap<OpRef, OpRef>,
    /// Send operation that satisfies a given match index.
    send_cause: HashMap<u64, OpRef>,
}

impl ChainPartitioner {
    fn clear(&mut self) {
        self.chains.clear();
        self.assigned.clear();
        self.executed.clear();
        self.cause.clear();
        self.send_cause.clear();
    }

    fn predecessors(&self, op: OpRef, snapshot: &EntitySnapshot) -> Vec<OpRef> {
        let mut predecessors = Vec::new();
        if op.index > 0 {
            predecessors.push(OpRef {
                entity: op.entity,
                index: op.index - 1,
            });
        }
        if let Some(cause) = self.cause.get(&op) {
            predecessors.push(*cause);
        }
        if snapshot.operation.kind == OperationKind::Receive {
            if let Some(match_index) = snapshot.operation.match_index {
                if let Some(sender) = self.send_cause.get(&match_index) {
                    predecessors.push(*sender);
                }
            }
        }
        predecessors
    }

    /// Place every not-yet-assigned pending operation: append to the chain
    /// whose tail is a direct causal predecessor, otherwise open a new chain
    /// at a random priority position.
    fn assign(&mut self, candidates: &[EntitySnapshot], rng: &mut SplitMixRng) {
        for snapshot in candidates {
            let op = OpRef {
                entity: snapshot.id,
                index: snapshot.op_index,
            };
            if self.assigned.contains(&op) {
                continue;
            }
            let predecessors = self.predecessors(op, snapshot);
            let extends = self
                .chains
                .iter_mut()
                .find(|chain| chain.last().is_some_and(|tail| predecessors.contains(tail)));
            match extends {
                Some(chain) => chain.push(op),
                None => {
                    let position = rng.next_usize(self.chains.len() + 1);
                    self.chains.insert(position, vec![op]);
                    debug!(
                        "pctcp: new chain for entity {} at priority index {}",
                        op.entity, position
                    );
                }
            }
            self.assigned.insert(op);
        }
    }

    /// First unexecuted operation of a chain.
    fn head(&self, chain: &[OpRef]) -> Option<OpRef> {
        chain.iter().find(|op| !self.executed.contains(*op)).copied()
    }

    /// Highest-priority chain whose head is an enabled pending operation.
    fn highest_enabled(&self, enabled: &[&EntitySnapshot]) -> Option<usize> {
        self.chains.iter().position(|chain| {
            self.head(chain).is_some_and(|head| {
                enabled
                    .iter()
                    .any(|c| c.id == head.entity && c.op_index == head.index)
            })
        })
    }

    fn demote(&mut self, position: usize) {
        let chain = self.chains.remove(position);
        self.chains.push(chain);
    }

    /// Record that the chosen operation ran, along with the causal facts it
    /// establishes for operations observed later.
    fn execute(&mut self, snapshot: &EntitySnapshot) {
        let op = OpRef {
            entity: snapshot.id,
            index: snapshot.op_index,
        };
        self.executed.insert(op);
        match snapshot.operation.kind {
            OperationKind::Create => {
                if let Some(target) = snapshot.operation.target {
                    self.cause.insert(
                        OpRef {
                            entity: target,
                            index: 0,
                        },
                        op,
                    );
                }
            }
            OperationKind::Send => {
                if let Some(match_index) = snapshot.operation.match_index {
                    self.send_cause.insert(match_index, op);
                }
            }
            _ => {}
        }
    }

    fn chain_count(&self) -> usize {
        self.chains.len()
    }
}

pub struct PctcpStrategy {
    rng: SplitMixRng,
    max_steps: usize,
    steps: usize,
    schedule_length: usize,
    max_switch_points: usize,
    partitioner: ChainPartitioner,
    change_points: BTreeSet<usize>,
}

impl PctcpStrategy {
    pub fn new(seed: Seed, max_switch_points: usize, max_steps: usize) -> Self {
        PctcpStrategy {
            rng: SplitMixRng::new(seed),
            max_steps,
            steps: 0,
            schedule_length: 0,
            max_switch_points,
            partitioner: ChainPartitioner::default(),
            change_points: BTreeSet::new(),
        }
    }

    /// Number of chains currently partitioning the observed operations.
    pub fn chain_count(&self) -> usize {
        self.partitioner.chain_count()
    }

    fn draw_change_points(&mut self) {
        self.change_points.clear();
        let mut range: Vec<usize> = (0..self.schedule_length).collect();
        for i in (1..range.len()).rev() {
            let j = self.rng.next_usize(i + 1);
            range.swap(i, j);
        }
        for point in range.into_iter().take(self.max_switch_points) {
            self.change_points.insert(point);
        }
    }

    fn move_change_point_forward(&mut self) {
        self.change_points.remove(&self.steps);
        let mut candidate = self.steps + 1;
        while self.change_points.contains(&candidate) {
            candidate += 1;
        }
        self.change_points.insert(candidate);
    }

    fn choose(&mut self, candidates: &[EntitySnapshot]) -> Option<EntityId> {
        self.partitioner.assign(candidates, &mut self.rng);

        let enabled = enabled(candidates);
        if enabled.is_empty() {
            return None;
        }

        if self.change_points.contains(&self.steps) {
            if enabled.len() == 1 {
                self.move_change_point_forward();
            } else if let Some(position) = self.partitioner.highest_enabled(&enabled) {
                debug!("pctcp: demoted chain {} at step {}", position, self.steps);
                self.partitioner.demote(position);
            }
        }

        let chosen = match self.partitioner.highest_enabled(&enabled) {
            Some(position) => {
                let head = self.partitioner.head(&self.partitioner.chains[position])?;
                enabled.iter().find(|c| c.id == head.entity).copied()
            }
            // Every enabled op is assigned, so this only happens if chains
            // got ahead of the live execution; fall back to candidate order.
            None => enabled.first().copied(),
        };

        let chosen = chosen?;
        self.partitioner.execute(chosen);
        Some(chosen.id)
    }
}

impl Strategy for PctcpStrategy {
    fn next_entity(
        &mut self,
        candidates: &[EntitySnapshot],
        _current: EntityId,
    ) -> Result<Option<EntityId>, Divergence> {
        let chosen = self.choose(candidates);
        if chosen.is_some() {
            self.steps += 1;
        }
        Ok(chosen)
    }

    fn next_bool(&mut self, max_value: u64) -> Result<Option<bool>, Divergence> {
        self.steps += 1;
        Ok(Some(self.rng.next_bounded(max_value) == 0))
    }

    fn next_int(&mut self, max_value: u64) -> Result<Option<u64>, Divergence> {
        self.steps += 1;
        Ok(Some(self.rng.next_bounded(max_value)))
    }

    fn force_next(&mut self, next: EntityId, candidates: &[EntitySnapshot], _current: EntityId) {
        self.partitioner.assign(candidates, &mut self.rng);
        if let Some(snapshot) = candidates.iter().find(|c| c.id == next) {
            self.partitioner.execute(snapshot);
        }
        self.steps += 1;
    }

    fn force_next_bool(&mut self, _next: bool) {
        self.steps += 1;
    }

    fn force_next_int(&mut self, _next: u64) {
        self.steps += 1;
    }

    fn prepare_for_next_iteration(&mut self) -> bool {
        self.schedule_length = self.schedule_length.max(self.steps);
        self.steps = 0;
        self.partitioner.clear();
        self.draw_change_points();
        true
    }

    fn reset(&mut self) {
        self.rng.restart();
        self.schedule_length = 0;
        self.steps = 0;
        self.partitioner.clear();
        self.change_points.clear();
    }

    fn scheduled_steps(&self) -> usize {
        self.steps
    }

    fn has_reached_max_steps(&self) -> bool {
        self.max_steps > 0 && self.steps >= self.max_steps
    }

    fn is_fair(&self) -> bool {
        false
    }

    fn description(&self) -> String {
        format!(
            "pctcp ({} priority change points, seed {})",
            self.max_switch_points,
            self.rng.initial_seed()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityStatus, Operation};

    fn snapshot(id: u64, op_index: u64, operation: Operation) -> EntitySnapshot {
        EntitySnapshot {
            id: EntityId(id),
            status: EntityStatus::Enabled,
            operation,
            op_index,
        }
    }

    #[test]
    fn test_single_entity_forms_one_chain() {
        let mut pctcp = PctcpStrategy::new(Seed::from_u64(1), 0, 0);
        for index in 0..5 {
            let candidates = vec![snapshot(0, index, Operation::send(EntityId(9), index))];
            assert_eq!(
                pctcp.next_entity(&candidates, EntityId(0)).unwrap(),
                Some(EntityId(0))
            );
        }
        assert_eq!(pctcp.chain_count(), 1);
    }

    #[test]
    fn test_matching_receive_joins_sender_chain() {
        let mut pctcp = PctcpStrategy::new(Seed::from_u64(1), 0, 0);

        // Entity 0 sends with match index 7, then entity 1's receive of the
        // same match index shows up as the only pending work.
        let send = vec![snapshot(0, 0, Operation::send(EntityId(1), 7))];
        pctcp.next_entity(&send, EntityId(0)).unwrap();
        assert_eq!(pctcp.chain_count(), 1);

        let receive = vec![snapshot(1, 0, Operation::receive(7))];
        assert_eq!(
            pctcp.next_entity(&receive, EntityId(0)).unwrap(),
            Some(EntityId(1))
        );
        assert_eq!(pctcp.chain_count(), 1);
    }

    #[test]
    fn test_unrelated_entities_get_separate_chains() {
        let mut pctcp = PctcpStrategy::new(Seed::from_u64(1), 0, 0);
        let candidates = vec![
            snapshot(0, 0, Operation::send(EntityId(5), 0)),
            snapshot(1, 0, Operation::send(EntityId(6), 1)),
        ];
        pctcp.next_entity(&candidates, EntityId(0)).unwrap();
        assert_eq!(pctcp.chain_count(), 2);
    }

    #[test]
    fn test_created_entity_start_continues_creator_chain() {
        let mut pctcp = PctcpStrategy::new(Seed::from_u64(1), 0, 0);

        let create = vec![snapshot(0, 0, Operation::create(EntityId(1)))];
        pctcp.next_entity(&create, EntityId(0)).unwrap();

        // The child's start is the causal continuation of the create and is
        // assigned first, so it extends the creator's chain.
        let start = vec![snapshot(1, 0, Operation::start())];
        assert_eq!(
            pctcp.next_entity(&start, EntityId(0)).unwrap(),
            Some(EntityId(1))
        );
        assert_eq!(pctcp.chain_count(), 1);
    }

    #[test]
    fn test_deterministic_per_seed() {
        let candidates = vec![
            snapshot(0, 0, Operation::send(EntityId(5), 0)),
            snapshot(1, 0, Operation::send(EntityId(6), 1)),
            snapshot(2, 0, Operation::send(EntityId(7), 2)),
        ];
        let mut a = PctcpStrategy::new(Seed::from_u64(21), 2, 0);
        let mut b = PctcpStrategy::new(Seed::from_u64(21), 2, 0);
        assert_eq!(
            a.next_entity(&candidates, EntityId(0)).unwrap(),
            b.next_entity(&candidates, EntityId(0)).unwrap()
        );
    }
}
