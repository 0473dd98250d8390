//! Priority-based probabilistic concurrency testing.
//!
//! Keeps a randomized priority ordering over every entity seen so far and
//! always runs the highest-priority enabled entity. A handful of priority
//! change points, drawn uniformly over the schedule length, demote the
//! current highest-priority entity to the bottom. A bug reachable with at
//! most `d` priority-relevant points is found with probability at least
//! 1/(n * d) per iteration.

use crate::entity::{EntityId, EntitySnapshot};
use crate::rng::{Seed, SplitMixRng};
use crate::strategy::{enabled, Divergence, Strategy};
use log::debug;
use std::collections::BTreeSet;

pub struct PctStrategy {
    rng: SplitMixRng,
    max_steps: usize,
    steps: usize,
    /// Longest iteration seen so far; change points are drawn over it.
    schedule_length: usize,
    max_switch_points: usize,
    /// Front of the list is the highest priority.
    prioritized: Vec<EntityId>,
    change_points: BTreeSet<usize>,
}

impl PctStrategy {
    pub fn new(seed: Seed, max_switch_points: usize, max_steps: usize) -> Self {
        PctStrategy {
            rng: SplitMixRng::new(seed),
            max_steps,
            steps: 0,
            schedule_length: 0,
            max_switch_points,
            prioritized: Vec::new(),
            change_points: BTreeSet::new(),
        }
    }

    /// Track newly observed entities and apply any change point due at the
    /// current step. Returns the highest-priority enabled entity.
    fn prioritized_choice(
        &mut self,
        enabled: &[&EntitySnapshot],
        current: EntityId,
    ) -> Option<EntityId> {
        if self.prioritized.is_empty() {
            self.prioritized.push(current);
        }

        for candidate in enabled {
            if !self.prioritized.contains(&candidate.id) {
                // Never ahead of the current head.
                let index = self.rng.next_usize(self.prioritized.len()) + 1;
                let index = index.min(self.prioritized.len());
                self.prioritized.insert(index, candidate.id);
                debug!(
                    "pct: new entity {} at priority index {}",
                    candidate.id, index
                );
            }
        }

        if self.change_points.contains(&self.steps) {
            if enabled.len() == 1 {
                self.move_change_point_forward();
            } else if let Some(demoted) = self.highest_priority_enabled(enabled) {
                self.prioritized.retain(|id| *id != demoted);
                self.prioritized.push(demoted);
                debug!("pct: demoted entity {} at step {}", demoted, self.steps);
            }
        }

        self.highest_priority_enabled(enabled)
    }

    fn highest_priority_enabled(&self, enabled: &[&EntitySnapshot]) -> Option<EntityId> {
        self.prioritized
            .iter()
            .find(|id| enabled.iter().any(|c| c.id == **id))
            .copied()
    }

    /// A change point that lands on a step with a single enabled entity is
    /// wasted; slide it to the next free step instead.
    fn move_change_point_forward(&mut self) {
        self.change_points.remove(&self.steps);
        let mut candidate = self.steps + 1;
        while self.change_points.contains(&candidate) {
            candidate += 1;
        }
        self.change_points.insert(candidate);
    }

    fn draw_change_points(&mut self) {
        self.change_points.clear();
        let mut range: Vec<usize> = (0..self.schedule_length).collect();
        // Fisher-Yates.
        for i in (1..range.len()).rev() {
            let j = self.rng.next_usize(i + 1);
            range.swap(i, j);
        }
        for point in range.into_iter().take(self.max_switch_points) {
            self.change_points.insert(point);
        }
    }
}

impl Strategy for PctStrategy {
    fn next_entity(
        &mut self,
        candidates: &[EntitySnapshot],
        current: EntityId,
    ) -> Result<Option<EntityId>, Divergence> {
        let enabled = enabled(candidates);
        if enabled.is_empty() {
            return Ok(None);
        }
        let chosen = self.prioritized_choice(&enabled, current);
        self.steps += 1;
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

    fn force_next(&mut self, next: EntityId, candidates: &[EntitySnapshot], current: EntityId) {
        // Keep the priority bookkeeping aligned with the imposed decision.
        let enabled = enabled(candidates);
        if !enabled.is_empty() {
            self.prioritized_choice(&enabled, current);
        }
        if !self.prioritized.contains(&next) {
            self.prioritized.push(next);
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
        self.prioritized.clear();
        self.draw_change_points();
        true
    }

    fn reset(&mut self) {
        self.rng.restart();
        self.schedule_length = 0;
        self.steps = 0;
        self.prioritized.clear();
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
            "pct ({} priority change points, seed {})",
            self.max_switch_points,
            self.rng.initial_seed()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testing::{all_enabled, with_blocked};

    #[test]
    fn test_current_entity_keeps_top_priority_without_change_points() {
        let mut pct = PctStrategy::new(Seed::from_u64(11), 0, 0);
        let candidates = all_enabled(&[0, 1, 2, 3]);
        for _ in 0..20 {
            // New entities are inserted strictly below the head.
            assert_eq!(
                pct.next_entity(&candidates, EntityId(0)).unwrap(),
                Some(EntityId(0))
            );
        }
    }

    #[test]
    fn test_blocked_head_falls_through_to_next_priority() {
        let mut pct = PctStrategy::new(Seed::from_u64(11), 0, 0);
        let candidates = all_enabled(&[0, 1]);
        pct.next_entity(&candidates, EntityId(0)).unwrap();

        let blocked_head = with_blocked(&[1], &[0]);
        assert_eq!(
            pct.next_entity(&blocked_head, EntityId(0)).unwrap(),
            Some(EntityId(1))
        );
    }

    #[test]
    fn test_deterministic_per_seed() {
        let candidates = all_enabled(&[0, 1, 2]);
        let mut a = PctStrategy::new(Seed::from_u64(7), 2, 0);
        let mut b = PctStrategy::new(Seed::from_u64(7), 2, 0);
        for iteration in 0..5 {
            for _ in 0..6 {
                assert_eq!(
                    a.next_entity(&candidates, EntityId(0)).unwrap(),
                    b.next_entity(&candidates, EntityId(0)).unwrap(),
                    "diverged in iteration {}",
                    iteration
                );
            }
            assert!(a.prepare_for_next_iteration());
            assert!(b.prepare_for_next_iteration());
        }
    }

    #[test]
    fn test_change_points_cause_demotion() {
        let mut pct = PctStrategy::new(Seed::from_u64(3), 4, 0);
        let candidates = all_enabled(&[0, 1]);

        // First iteration fixes the schedule length; the second has change
        // points covering every step, so the head must be demoted at least
        // once.
        for _ in 0..4 {
            pct.next_entity(&candidates, EntityId(0)).unwrap();
        }
        pct.prepare_for_next_iteration();

        let picks: Vec<_> = (0..4)
            .map(|_| {
                pct.next_entity(&candidates, EntityId(0))
                    .unwrap()
                    .unwrap()
            })
            .collect();
        assert!(
            picks.iter().any(|p| *p != picks[0]),
            "expected a demotion among {:?}",
            picks
        );
    }

    #[test]
    fn test_change_point_moves_forward_when_single_choice() {
        let mut pct = PctStrategy::new(Seed::from_u64(3), 1, 0);
        let solo = all_enabled(&[0]);
        pct.next_entity(&solo, EntityId(0)).unwrap();
        pct.prepare_for_next_iteration();

        // Only one entity enabled at the change point; the point slides
        // forward instead of being consumed.
        pct.next_entity(&solo, EntityId(0)).unwrap();
        assert!(!pct.change_points.is_empty());
    }
}
