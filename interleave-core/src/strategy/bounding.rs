//! Delay-bounded and operation-bounded scheduling.
//!
//! Both run the current entity until it blocks and spend a small budget of
//! "delays" to deviate from that baseline. Few context switches are enough
//! to expose many real bugs, so a small budget explores cheaply.

use crate::entity::{EntityId, EntitySnapshot, OperationKind};
use crate::rng::{Seed, SplitMixRng};
use crate::strategy::{enabled, Divergence, Strategy};
use log::debug;

fn draw_sorted_delays(
    rng: &mut SplitMixRng,
    count: usize,
    schedule_length: usize,
) -> Vec<usize> {
    let mut delays: Vec<usize> = (0..count)
        .map(|_| rng.next_usize(schedule_length.max(1)))
        .collect();
    delays.sort_unstable();
    delays
}

/// Runs the current entity until it blocks, except at up to `max_delays`
/// randomly drawn steps where the choice rotates to the next enabled entity
/// in round-robin order.
pub struct DelayBoundingStrategy {
    rng: SplitMixRng,
    max_delays: usize,
    remaining_delays: Vec<usize>,
    max_steps: usize,
    steps: usize,
    schedule_length: usize,
}

impl DelayBoundingStrategy {
    pub fn new(seed: Seed, max_delays: usize, max_steps: usize) -> Self {
        DelayBoundingStrategy {
            rng: SplitMixRng::new(seed),
            max_delays,
            remaining_delays: Vec::new(),
            max_steps,
            steps: 0,
            schedule_length: 0,
        }
    }

    /// Consume every delay due at the current step, returning how far to
    /// rotate from the current entity.
    fn consume_delays(&mut self, modulus: usize) -> usize {
        let mut rotation = 0;
        while self
            .remaining_delays
            .first()
            .is_some_and(|delay| *delay == self.steps)
        {
            rotation = (rotation + 1) % modulus;
            self.remaining_delays.remove(0);
            debug!(
                "delay bounding: inserted delay, {} remaining",
                self.remaining_delays.len()
            );
        }
        rotation
    }
}

impl Strategy for DelayBoundingStrategy {
    fn next_entity(
        &mut self,
        candidates: &[EntitySnapshot],
        current: EntityId,
    ) -> Result<Option<EntityId>, Divergence> {
        let enabled = enabled(candidates);
        if enabled.is_empty() {
            return Ok(None);
        }

        // Candidates reordered to start at the current entity, so rotation
        // zero means "keep running it".
        let start = enabled
            .iter()
            .position(|c| c.id == current)
            .unwrap_or(0);
        let rotation = self.consume_delays(enabled.len());
        let chosen = enabled[(start + rotation) % enabled.len()].id;

        self.steps += 1;
        Ok(Some(chosen))
    }

    fn next_bool(&mut self, _max_value: u64) -> Result<Option<bool>, Divergence> {
        let due = self.consume_delays(2) != 0;
        self.steps += 1;
        Ok(Some(due))
    }

    fn next_int(&mut self, max_value: u64) -> Result<Option<u64>, Divergence> {
        let rotation = self.consume_delays(max_value.max(1) as usize);
        self.steps += 1;
        Ok(Some(rotation as u64 % max_value.max(1)))
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
        self.schedule_length = self.schedule_length.max(self.steps);
        self.steps = 0;
        self.remaining_delays =
            draw_sorted_delays(&mut self.rng, self.max_delays, self.schedule_length);
        true
    }

    fn reset(&mut self) {
        self.rng.restart();
        self.steps = 0;
        self.schedule_length = 0;
        self.remaining_delays.clear();
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
            "delay bounding ({} delays, seed {})",
            self.max_delays,
            self.rng.initial_seed()
        )
    }
}

/// Prioritizes one kind of logical operation at a time; operation delays
/// rotate which kind is prioritized, plain delays rotate within the
/// prioritized group.
pub struct OperationBoundingStrategy {
    rng: SplitMixRng,
    max_operation_delays: usize,
    max_delays: usize,
    remaining_operation_delays: Vec<usize>,
    remaining_delays: Vec<usize>,
    prioritized: Option<OperationKind>,
    max_steps: usize,
    steps: usize,
    schedule_length: usize,
}

impl OperationBoundingStrategy {
    pub fn new(seed: Seed, operation_delays: usize, delays: usize, max_steps: usize) -> Self {
        OperationBoundingStrategy {
            rng: SplitMixRng::new(seed),
            max_operation_delays: operation_delays,
            max_delays: delays,
            remaining_operation_delays: Vec::new(),
            remaining_delays: Vec::new(),
            prioritized: None,
            max_steps,
            steps: 0,
            schedule_length: 0,
        }
    }

    /// Operation kinds present among the enabled candidates, in candidate
    /// order without duplicates.
    fn kinds_present(enabled: &[&EntitySnapshot]) -> Vec<OperationKind> {
        let mut kinds = Vec::new();
        for candidate in enabled {
            if !kinds.contains(&candidate.operation.kind) {
                kinds.push(candidate.operation.kind);
            }
        }
        kinds
    }
}

impl Strategy for OperationBoundingStrategy {
    fn next_entity(
        &mut self,
        candidates: &[EntitySnapshot],
        _current: EntityId,
    ) -> Result<Option<EntityId>, Divergence> {
        let enabled = enabled(candidates);
        if enabled.is_empty() {
            return Ok(None);
        }

        let kinds = Self::kinds_present(&enabled);
        let mut prioritized = match self.prioritized {
            Some(kind) if kinds.contains(&kind) => kind,
            _ => kinds[0],
        };

        while self
            .remaining_operation_delays
            .first()
            .is_some_and(|delay| *delay == self.steps)
        {
            let at = kinds.iter().position(|k| *k == prioritized).unwrap_or(0);
            prioritized = kinds[(at + 1) % kinds.len()];
            self.remaining_operation_delays.remove(0);
            debug!(
                "operation bounding: prioritized operation now {:?}, {} operation delays left",
                prioritized,
                self.remaining_operation_delays.len()
            );
        }
        self.prioritized = Some(prioritized);

        let group: Vec<&&EntitySnapshot> = enabled
            .iter()
            .filter(|c| c.operation.kind == prioritized)
            .collect();

        let mut index = 0;
        while self
            .remaining_delays
            .first()
            .is_some_and(|delay| *delay == self.steps)
        {
            index = (index + 1) % group.len();
            self.remaining_delays.remove(0);
            debug!(
                "operation bounding: inserted delay, {} remaining",
                self.remaining_delays.len()
            );
        }

        self.steps += 1;
        Ok(Some(group[index].id))
    }

    fn next_bool(&mut self, _max_value: u64) -> Result<Option<bool>, Divergence> {
        let mut due = false;
        while self
            .remaining_delays
            .first()
            .is_some_and(|delay| *delay == self.steps)
        {
            due = !due;
            self.remaining_delays.remove(0);
        }
        self.steps += 1;
        Ok(Some(due))
    }

    fn next_int(&mut self, max_value: u64) -> Result<Option<u64>, Divergence> {
        let mut value = 0;
        while self
            .remaining_delays
            .first()
            .is_some_and(|delay| *delay == self.steps)
        {
            value = (value + 1) % max_value.max(1);
            self.remaining_delays.remove(0);
        }
        self.steps += 1;
        Ok(Some(value))
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
        self.schedule_length = self.schedule_length.max(self.steps);
        self.steps = 0;
        self.prioritized = None;
        self.remaining_operation_delays = draw_sorted_delays(
            &mut self.rng,
            self.max_operation_delays,
            self.schedule_length,
        );
        self.remaining_delays =
            draw_sorted_delays(&mut self.rng, self.max_delays, self.schedule_length);
        true
    }

    fn reset(&mut self) {
        self.rng.restart();
        self.steps = 0;
        self.schedule_length = 0;
        self.prioritized = None;
        self.remaining_operation_delays.clear();
        self.remaining_delays.clear();
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
            "operation bounding ({} operation delays, {} delays, seed {})",
            self.max_operation_delays,
            self.max_delays,
            self.rng.initial_seed()
        )
    }
}
