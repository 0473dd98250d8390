//! Deterministic playback of a recorded trace.

use crate::entity::{EntityId, EntitySnapshot};
use crate::strategy::{Divergence, Strategy};
use crate::trace::{Decision, Trace};

/// Feeds back a previously recorded trace decision for decision. Raises
/// [`Divergence`] when the live execution no longer matches the recording,
/// which means the schedule depended on something outside scheduler control.
///
/// An optional suffix strategy takes over once the trace is exhausted, so a
/// replayed prefix can seed further exploration.
pub struct ReplayStrategy {
    trace: Trace,
    index: usize,
    steps: usize,
    suffix: Option<Box<dyn Strategy>>,
}

impl ReplayStrategy {
    pub fn new(trace: Trace) -> Self {
        ReplayStrategy {
            trace,
            index: 0,
            steps: 0,
            suffix: None,
        }
    }

    pub fn with_suffix(trace: Trace, suffix: Box<dyn Strategy>) -> Self {
        ReplayStrategy {
            trace,
            index: 0,
            steps: 0,
            suffix: Some(suffix),
        }
    }

    fn exhausted(&self) -> bool {
        self.index >= self.trace.len()
    }
}

impl Strategy for ReplayStrategy {
    fn next_entity(
        &mut self,
        candidates: &[EntitySnapshot],
        current: EntityId,
    ) -> Result<Option<EntityId>, Divergence> {
        // No enabled candidate is a scheduler question (deadlock or normal
        // termination), not a divergence; the recording ended the same way.
        if !candidates.iter().any(|c| c.is_enabled()) {
            return Ok(None);
        }

        if self.exhausted() {
            return match &mut self.suffix {
                Some(suffix) => suffix.next_entity(candidates, current),
                None => Err(Divergence::new("execution is longer than the recorded trace")),
            };
        }

        let decision = match self.trace.get(self.index) {
            Some(Decision::Schedule(id)) => id,
            _ => return Err(Divergence::new("next recorded step is not a scheduling choice")),
        };

        if !candidates.iter().any(|c| c.id == decision && c.is_enabled()) {
            return Err(Divergence::new(format!(
                "recorded entity '{}' is not in the enabled set",
                decision
            )));
        }

        self.index += 1;
        self.steps += 1;
        Ok(Some(decision))
    }

    fn next_bool(&mut self, max_value: u64) -> Result<Option<bool>, Divergence> {
        if self.exhausted() {
            return match &mut self.suffix {
                Some(suffix) => suffix.next_bool(max_value),
                None => Err(Divergence::new("execution is longer than the recorded trace")),
            };
        }

        let value = match self.trace.get(self.index) {
            Some(Decision::Bool(value)) => value,
            _ => {
                return Err(Divergence::new(
                    "next recorded step is not a boolean choice",
                ))
            }
        };

        self.index += 1;
        self.steps += 1;
        Ok(Some(value))
    }

    fn next_int(&mut self, max_value: u64) -> Result<Option<u64>, Divergence> {
        if self.exhausted() {
            return match &mut self.suffix {
                Some(suffix) => suffix.next_int(max_value),
                None => Err(Divergence::new("execution is longer than the recorded trace")),
            };
        }

        let value = match self.trace.get(self.index) {
            Some(Decision::Int(value)) => value,
            _ => {
                return Err(Divergence::new(
                    "next recorded step is not an integer choice",
                ))
            }
        };

        self.index += 1;
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
        // One playback of the trace; only a suffix strategy keeps exploring.
        match &mut self.suffix {
            Some(suffix) => {
                self.index = 0;
                self.steps = 0;
                suffix.prepare_for_next_iteration()
            }
            None => false,
        }
    }

    fn reset(&mut self) {
        self.index = 0;
        self.steps = 0;
        if let Some(suffix) = &mut self.suffix {
            suffix.reset();
        }
    }

    fn scheduled_steps(&self) -> usize {
        self.steps
    }

    fn has_reached_max_steps(&self) -> bool {
        match &self.suffix {
            Some(suffix) if self.exhausted() => suffix.has_reached_max_steps(),
            _ => false,
        }
    }

    fn is_fair(&self) -> bool {
        match &self.suffix {
            Some(suffix) => suffix.is_fair(),
            None => false,
        }
    }

    fn description(&self) -> String {
        match &self.suffix {
            Some(suffix) => format!("replay (then {})", suffix.description()),
            None => "replay".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Seed;
    use crate::strategy::testing::{all_enabled, with_blocked};
    use crate::strategy::RandomStrategy;

    fn recorded() -> Trace {
        let mut trace = Trace::new();
        trace.push(Decision::Schedule(EntityId(1)));
        trace.push(Decision::Bool(true));
        trace.push(Decision::Schedule(EntityId(0)));
        trace
    }

    #[test]
    fn test_replay_follows_trace() {
        let mut replay = ReplayStrategy::new(recorded());
        let candidates = all_enabled(&[0, 1]);

        assert_eq!(
            replay.next_entity(&candidates, EntityId(0)).unwrap(),
            Some(EntityId(1))
        );
        assert_eq!(replay.next_bool(2).unwrap(), Some(true));
        assert_eq!(
            replay.next_entity(&candidates, EntityId(1)).unwrap(),
            Some(EntityId(0))
        );
        assert_eq!(replay.scheduled_steps(), 3);
    }

    #[test]
    fn test_replay_diverges_when_entity_not_enabled() {
        let mut replay = ReplayStrategy::new(recorded());
        let candidates = with_blocked(&[0], &[1]);
        let err = replay.next_entity(&candidates, EntityId(0)).unwrap_err();
        assert!(err.message.contains("'1'"));
    }

    #[test]
    fn test_replay_diverges_on_decision_kind_mismatch() {
        let mut replay = ReplayStrategy::new(recorded());
        assert!(replay.next_bool(2).is_err());
    }

    #[test]
    fn test_replay_yields_no_continuation_when_nothing_enabled() {
        // An exhausted trace with an empty enabled set is how a recorded
        // deadlock or normal completion looks on playback.
        let mut replay = ReplayStrategy::new(Trace::new());
        let candidates = with_blocked(&[], &[0, 1]);
        assert_eq!(
            replay.next_entity(&candidates, EntityId(0)).unwrap(),
            None
        );
    }

    #[test]
    fn test_replay_diverges_past_end_of_trace() {
        let mut replay = ReplayStrategy::new(Trace::new());
        let candidates = all_enabled(&[0]);
        assert!(replay.next_entity(&candidates, EntityId(0)).is_err());
    }

    #[test]
    fn test_suffix_takes_over_after_trace() {
        let suffix = Box::new(RandomStrategy::new(Seed::from_u64(3), 0));
        let mut trace = Trace::new();
        trace.push(Decision::Schedule(EntityId(0)));
        let mut replay = ReplayStrategy::with_suffix(trace, suffix);

        let candidates = all_enabled(&[0, 1]);
        assert_eq!(
            replay.next_entity(&candidates, EntityId(0)).unwrap(),
            Some(EntityId(0))
        );
        // Past the recording; the suffix answers instead of diverging.
        assert!(replay.next_entity(&candidates, EntityId(0)).is_ok());
    }

    #[test]
    fn test_replay_runs_single_iteration_without_suffix() {
        let mut replay = ReplayStrategy::new(recorded());
        assert!(!replay.prepare_for_next_iteration());
    }
}
