//! Random and sticky-random scheduling.

use crate::entity::{EntityId, EntitySnapshot};
use crate::rng::{Seed, SplitMixRng};
use crate::strategy::{enabled, Divergence, Strategy};

/// Picks uniformly among the enabled candidates at every scheduling point.
#[derive(Debug)]
pub struct RandomStrategy {
    rng: SplitMixRng,
    max_steps: usize,
    steps: usize,
}

impl RandomStrategy {
    pub fn new(seed: Seed, max_steps: usize) -> Self {
        RandomStrategy {
            rng: SplitMixRng::new(seed),
            max_steps,
            steps: 0,
        }
    }
}

impl Strategy for RandomStrategy {
    fn next_entity(
        &mut self,
        candidates: &[EntitySnapshot],
        _current: EntityId,
    ) -> Result<Option<EntityId>, Divergence> {
        let enabled = enabled(candidates);
        if enabled.is_empty() {
            return Ok(None);
        }
        let index = self.rng.next_usize(enabled.len());
        self.steps += 1;
        Ok(Some(enabled[index].id))
    }

    fn next_bool(&mut self, max_value: u64) -> Result<Option<bool>, Divergence> {
        self.steps += 1;
        Ok(Some(self.rng.next_bounded(max_value) == 0))
    }

    fn next_int(&mut self, max_value: u64) -> Result<Option<u64>, Divergence> {
        self.steps += 1;
        Ok(Some(self.rng.next_bounded(max_value)))
    }

    fn force_next(&mut self, _next: EntityId, _candidates: &[EntitySnapshot], _current: EntityId) {
        self.steps += 1;
    }

    fn force_next_bool(&mut self, _next: bool) {
        self.steps += 1;
    }

    fn force_next_int(&mut self, _next: u64) {
        self.steps += 1;
    }

    fn prepare_for_next_iteration(&mut self) -> bool {
        self.steps = 0;
        true
    }

    fn reset(&mut self) {
        self.rng.restart();
        self.steps = 0;
    }

    fn scheduled_steps(&self) -> usize {
        self.steps
    }

    fn has_reached_max_steps(&self) -> bool {
        self.max_steps > 0 && self.steps >= self.max_steps
    }

    fn is_fair(&self) -> bool {
        true
    }

    fn description(&self) -> String {
        format!("random (seed {})", self.rng.initial_seed())
    }
}

/// Random scheduling biased toward staying on the current entity.
///
/// Before re-randomizing, `difficulty` fair coins are flipped; the scheduler
/// stays on the current entity unless every flip comes up tails. The stick
/// probability is therefore `1 - 2^-difficulty`, giving long same-entity
/// stretches while still exercising more interleavings than run-to-block.
#[derive(Debug)]
pub struct ProbabilisticRandomStrategy {
    rng: SplitMixRng,
    difficulty: u32,
    max_steps: usize,
    steps: usize,
}

impl ProbabilisticRandomStrategy {
    pub fn new(seed: Seed, difficulty: u32, max_steps: usize) -> Self {
        ProbabilisticRandomStrategy {
            rng: SplitMixRng::new(seed),
            difficulty,
            max_steps,
            steps: 0,
        }
    }

    fn should_stay(&mut self) -> bool {
        for _ in 0..self.difficulty {
            if self.rng.next_bool() {
                return true;
            }
        }
        false
    }
}

impl Strategy for ProbabilisticRandomStrategy {
    fn next_entity(
        &mut self,
        candidates: &[EntitySnapshot],
        current: EntityId,
    ) -> Result<Option<EntityId>, Divergence> {
        let enabled = enabled(candidates);
        if enabled.is_empty() {
            return Ok(None);
        }
        self.steps += 1;

        if enabled.iter().any(|c| c.id == current) && self.should_stay() {
            return Ok(Some(current));
        }

        let index = self.rng.next_usize(enabled.len());
        Ok(Some(enabled[index].id))
    }

    fn next_bool(&mut self, max_value: u64) -> Result<Option<bool>, Divergence> {
        self.steps += 1;
        Ok(Some(self.rng.next_bounded(max_value) == 0))
    }

    fn next_int(&mut self, max_value: u64) -> Result<Option<u64>, Divergence> {
        self.steps += 1;
        Ok(Some(self.rng.next_bounded(max_value)))
    }

    fn force_next(&mut self, _next: EntityId, _candidates: &[EntitySnapshot], _current: EntityId) {
        self.steps += 1;
    }

    fn force_next_bool(&mut self, _next: bool) {
        self.steps += 1;
    }

    fn force_next_int(&mut self, _next: u64) {
        self.steps += 1;
    }

    fn prepare_for_next_iteration(&mut self) -> bool {
        self.steps = 0;
        true
    }

    fn reset(&mut self) {
        self.rng.restart();
        self.steps = 0;
    }

    fn scheduled_steps(&self) -> usize {
        self.steps
    }

    fn has_reached_max_steps(&self) -> bool {
        self.max_steps > 0 && self.steps >= self.max_steps
    }

    fn is_fair(&self) -> bool {
        true
    }

    fn description(&self) -> String {
        format!(
            "probabilistic random (difficulty {}, seed {})",
            self.difficulty,
            self.rng.initial_seed()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::testing::{all_enabled, with_blocked};

    #[test]
    fn test_random_picks_only_enabled_entities() {
        let mut strategy = RandomStrategy::new(Seed::from_u64(1), 0);
        let candidates = with_blocked(&[1, 3], &[2]);
        for _ in 0..100 {
            let chosen = strategy.next_entity(&candidates, EntityId(1)).unwrap();
            let chosen = chosen.unwrap();
            assert!(chosen == EntityId(1) || chosen == EntityId(3));
        }
    }

    #[test]
    fn test_random_returns_none_when_nothing_enabled() {
        let mut strategy = RandomStrategy::new(Seed::from_u64(1), 0);
        let candidates = with_blocked(&[], &[1, 2]);
        assert_eq!(
            strategy.next_entity(&candidates, EntityId(1)).unwrap(),
            None
        );
    }

    #[test]
    fn test_random_is_deterministic_per_seed() {
        let candidates = all_enabled(&[0, 1, 2, 3]);
        let mut a = RandomStrategy::new(Seed::from_u64(99), 0);
        let mut b = RandomStrategy::new(Seed::from_u64(99), 0);
        for _ in 0..50 {
            assert_eq!(
                a.next_entity(&candidates, EntityId(0)).unwrap(),
                b.next_entity(&candidates, EntityId(0)).unwrap()
            );
        }
    }

    #[test]
    fn test_random_step_bound() {
        let mut strategy = RandomStrategy::new(Seed::from_u64(1), 3);
        let candidates = all_enabled(&[0, 1]);
        assert!(!strategy.has_reached_max_steps());
        for _ in 0..3 {
            strategy.next_entity(&candidates, EntityId(0)).unwrap();
        }
        assert!(strategy.has_reached_max_steps());
        assert!(strategy.prepare_for_next_iteration());
        assert!(!strategy.has_reached_max_steps());
    }

    #[test]
    fn test_probabilistic_sticks_more_often_than_uniform() {
        let candidates = all_enabled(&[0, 1]);
        let mut strategy = ProbabilisticRandomStrategy::new(Seed::from_u64(5), 3, 0);
        let mut stayed = 0;
        let total = 2000;
        for _ in 0..total {
            if strategy.next_entity(&candidates, EntityId(0)).unwrap() == Some(EntityId(0)) {
                stayed += 1;
            }
        }
        // Expected stick rate is 7/8 plus half of the remaining 1/8.
        assert!(stayed > total * 3 / 4, "stayed only {} of {}", stayed, total);
    }

    #[test]
    fn test_probabilistic_rerandomizes_when_current_blocked() {
        let candidates = with_blocked(&[1], &[0]);
        let mut strategy = ProbabilisticRandomStrategy::new(Seed::from_u64(5), 3, 0);
        assert_eq!(
            strategy.next_entity(&candidates, EntityId(0)).unwrap(),
            Some(EntityId(1))
        );
    }
}
