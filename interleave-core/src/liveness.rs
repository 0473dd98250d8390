//! Liveness checking over the fingerprint history of one iteration.
//!
//! A monitor is hot while a progress obligation is outstanding and cold once
//! it has been met. If the program can revisit a configuration without any
//! monitor that was hot at the first visit cooling down in between, it can
//! loop forever with the obligation unmet.

use crate::cache::Fingerprint;
use std::fmt;

/// Stable identity of a liveness monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonitorId(pub u64);

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Temperature of a monitor's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temperature {
    /// A progress obligation is pending.
    Hot,
    /// The obligation has been satisfied.
    Cold,
    /// Neither flagged hot nor cold.
    Neutral,
}

/// Program configuration after one completed scheduling step.
#[derive(Debug, Clone)]
pub struct StepState {
    pub fingerprint: Fingerprint,
    pub monitors: Vec<(MonitorId, Temperature)>,
}

/// Evidence of a hot cycle: the step range that repeats and the monitors
/// that stay hot across it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessWitness {
    /// Index of the first step of the repeating interval.
    pub cycle_start: usize,
    /// Index of the step whose fingerprint repeats `cycle_start`'s.
    pub cycle_end: usize,
    pub hot_monitors: Vec<MonitorId>,
}

impl fmt::Display for LivenessWitness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let monitors: Vec<String> = self.hot_monitors.iter().map(|m| m.to_string()).collect();
        write!(
            f,
            "monitor(s) [{}] stay hot across repeating steps {}..={}",
            monitors.join(", "),
            self.cycle_start,
            self.cycle_end
        )
    }
}

/// Collects the per-step fingerprint history and scans it for hot cycles at
/// quiescence. Never consulted for an iteration aborted by a safety bug; a
/// truncated run would produce false positives.
#[derive(Debug, Default)]
pub struct LivenessChecker {
    steps: Vec<StepState>,
}

impl LivenessChecker {
    pub fn new() -> Self {
        LivenessChecker { steps: Vec::new() }
    }

    pub fn record(&mut self, step: StepState) {
        self.steps.push(step);
    }

    pub fn steps_recorded(&self) -> usize {
        self.steps.len()
    }

    pub fn clear(&mut self) {
        self.steps.clear();
    }

    /// Scan for a repeated fingerprint whose interval keeps some
    /// start-of-interval hot monitor hot throughout. Latest repeats are
    /// preferred so the witness covers the longest observed prefix.
    pub fn check_at_quiescence(&self) -> Option<LivenessWitness> {
        for end in (1..self.steps.len()).rev() {
            for start in 0..end {
                if self.steps[start].fingerprint != self.steps[end].fingerprint {
                    continue;
                }
                let hot = self.hot_across_interval(start, end);
                if !hot.is_empty() {
                    return Some(LivenessWitness {
                        cycle_start: start,
                        cycle_end: end,
                        hot_monitors: hot,
                    });
                }
            }
        }
        None
    }

    /// Monitors hot at `start` that never reach cold in `start..=end`.
    fn hot_across_interval(&self, start: usize, end: usize) -> Vec<MonitorId> {
        let mut hot: Vec<MonitorId> = self.steps[start]
            .monitors
            .iter()
            .filter(|(_, temperature)| *temperature == Temperature::Hot)
            .map(|(id, _)| *id)
            .collect();

        for step in &self.steps[start..=end] {
            hot.retain(|id| {
                !step
                    .monitors
                    .iter()
                    .any(|(m, temperature)| m == id && *temperature == Temperature::Cold)
            });
            if hot.is_empty() {
                break;
            }
        }

        hot.sort();
        hot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::program_fingerprint;

    fn step(state: u64, temperature: Temperature) -> StepState {
        StepState {
            fingerprint: program_fingerprint([state]),
            monitors: vec![(MonitorId(0), temperature)],
        }
    }

    #[test]
    fn test_hot_alternation_is_flagged() {
        let mut checker = LivenessChecker::new();
        // Alternates between two states, monitor hot throughout.
        checker.record(step(1, Temperature::Hot));
        checker.record(step(2, Temperature::Hot));
        checker.record(step(1, Temperature::Hot));

        let witness = checker.check_at_quiescence().unwrap();
        assert_eq!(witness.cycle_start, 0);
        assert_eq!(witness.cycle_end, 2);
        assert_eq!(witness.hot_monitors, vec![MonitorId(0)]);
    }

    #[test]
    fn test_cooling_monitor_is_not_flagged() {
        let mut checker = LivenessChecker::new();
        checker.record(step(1, Temperature::Hot));
        checker.record(step(2, Temperature::Cold));
        checker.record(step(1, Temperature::Hot));

        assert_eq!(checker.check_at_quiescence(), None);
    }

    #[test]
    fn test_cycle_with_no_hot_monitor_is_not_flagged() {
        let mut checker = LivenessChecker::new();
        checker.record(step(1, Temperature::Neutral));
        checker.record(step(2, Temperature::Neutral));
        checker.record(step(1, Temperature::Neutral));

        assert_eq!(checker.check_at_quiescence(), None);
    }

    #[test]
    fn test_no_repeat_no_witness() {
        let mut checker = LivenessChecker::new();
        checker.record(step(1, Temperature::Hot));
        checker.record(step(2, Temperature::Hot));
        checker.record(step(3, Temperature::Hot));

        assert_eq!(checker.check_at_quiescence(), None);
    }

    #[test]
    fn test_monitor_hot_only_inside_interval_is_not_blamed() {
        let mut checker = LivenessChecker::new();
        // Hot only at the middle step, cold at the interval boundaries.
        checker.record(step(1, Temperature::Cold));
        checker.record(step(2, Temperature::Hot));
        checker.record(step(1, Temperature::Cold));

        assert_eq!(checker.check_at_quiescence(), None);
    }
}
