//! The testing engine: runs a scenario through many schedules.
//!
//! Each iteration gets a fresh scheduler and runtime, but the strategy is
//! shared across the whole run so search state (DFS stacks, PCT schedule
//! lengths) carries over. Liveness is checked only for iterations that end
//! quiescent, and the visited-state cache aggregates coverage over the run.

use crate::runtime::{ControlledRuntime, EntityContext, MonitorDef, ScenarioResult};
use interleave_core::cache::{StateCache, VisitMark};
use interleave_core::error::{BugKind, BugReport, InterleaveError, Result};
use interleave_core::liveness::{LivenessChecker, Temperature};
use interleave_core::rng::Seed;
use interleave_core::scheduler::{IterationOutcome, Scheduler};
use interleave_core::strategy::{
    DelayBoundingStrategy, DfsStrategy, IterativeDeepeningDfsStrategy, OperationBoundingStrategy,
    PctStrategy, PctcpStrategy, ProbabilisticRandomStrategy, RandomStrategy, ReplayStrategy,
    Strategy,
};
use interleave_core::trace::Trace;
use log::{debug, info};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Which exploration strategy drives the run.
#[derive(Debug, Clone)]
pub enum StrategyKind {
    /// Uniform random choice among enabled entities.
    Random,
    /// Random, biased towards staying on the current entity; higher
    /// difficulty means longer uninterrupted stretches.
    ProbabilisticRandom { difficulty: u32 },
    /// Exhaustive depth-first enumeration of schedules.
    Dfs,
    /// DFS restarted with a growing step bound.
    IterativeDeepeningDfs { initial_depth: usize },
    /// Probabilistic concurrency testing with entity priorities.
    Pct { priority_change_points: usize },
    /// PCT over causally linked operation chains instead of entities.
    Pctcp { priority_change_points: usize },
    /// Round-robin deviation from the current entity at a few random steps.
    DelayBounding { delays: usize },
    /// Prioritizes one operation kind at a time.
    OperationBounding { operation_delays: usize, delays: usize },
    /// Deterministic replay of a recorded trace.
    Replay { trace: Trace },
}

/// Run configuration, built up in the usual chained style.
#[derive(Debug, Clone)]
pub struct Config {
    pub iterations: usize,
    pub max_steps: usize,
    /// Keep exploring after the first bug instead of stopping.
    pub full_exploration: bool,
    /// Wall-clock budget for the whole run.
    pub timeout: Option<Duration>,
    pub seed: Seed,
    pub strategy: StrategyKind,
    pub monitors: Vec<MonitorDef>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            iterations: 100,
            max_steps: 10_000,
            full_exploration: false,
            timeout: None,
            seed: Seed::random(),
            strategy: StrategyKind::Random,
            monitors: Vec::new(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_full_exploration(mut self) -> Self {
        self.full_exploration = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_seed(mut self, seed: Seed) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_monitor(mut self, monitor: MonitorDef) -> Self {
        self.monitors.push(monitor);
        self
    }
}

/// What a whole run produced.
#[derive(Debug)]
pub struct RunReport {
    /// Iterations actually executed.
    pub iterations: usize,
    /// First bug found, if any.
    pub bug: Option<BugReport>,
    /// Iteration index (zero-based) of the first bug.
    pub bug_iteration: Option<usize>,
    /// Longest decision sequence over all iterations.
    pub max_decisions: usize,
    /// Decisions summed over all iterations.
    pub total_decisions: usize,
    /// Distinct program fingerprints seen across the run.
    pub distinct_states: usize,
    pub strategy: String,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn found_bug(&self) -> bool {
        self.bug.is_some()
    }

    pub fn average_decisions(&self) -> usize {
        if self.iterations == 0 {
            0
        } else {
            self.total_decisions / self.iterations
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drives a scenario through repeated controlled iterations.
pub struct TestingEngine {
    config: Config,
    strategy: Arc<Mutex<Box<dyn Strategy>>>,
    cache: StateCache,
}

impl TestingEngine {
    pub fn new(config: Config) -> Result<Self> {
        let strategy = build_strategy(&config)?;
        Ok(TestingEngine {
            config,
            strategy: Arc::new(Mutex::new(strategy)),
            cache: StateCache::new(),
        })
    }

    /// Convenience constructor for reproducing a recorded trace.
    pub fn replay(trace: Trace) -> Result<Self> {
        TestingEngine::new(
            Config::new()
                .with_iterations(1)
                .with_strategy(StrategyKind::Replay { trace }),
        )
    }

    /// Run the scenario. The closure is invoked once per iteration as the
    /// root entity of a fresh runtime.
    pub fn run<F>(&mut self, scenario: F) -> RunReport
    where
        F: Fn(&mut EntityContext) -> Result<()> + Send + Sync + 'static,
    {
        let scenario = Arc::new(scenario);
        let started = Instant::now();
        let deadline = self.config.timeout.map(|timeout| started + timeout);
        info!("starting run: {}", lock(&self.strategy).description());

        let mut report = RunReport {
            iterations: 0,
            bug: None,
            bug_iteration: None,
            max_decisions: 0,
            total_decisions: 0,
            distinct_states: 0,
            strategy: lock(&self.strategy).description(),
            elapsed: Duration::ZERO,
        };

        for iteration in 0..self.config.iterations {
            let remaining = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(remaining) => Some(remaining),
                    None => {
                        debug!("run timeout reached before iteration {}", iteration);
                        break;
                    }
                },
                None => None,
            };

            let result = self.run_iteration(iteration, remaining, Arc::clone(&scenario));
            report.iterations += 1;
            report.max_decisions = report.max_decisions.max(result.trace.len());
            report.total_decisions += result.trace.len();

            let bug = self.evaluate_iteration(iteration, &result);
            if let Some(bug) = bug {
                debug!("iteration {} found a bug: {}", iteration, bug.kind);
                if report.bug.is_none() {
                    report.bug = Some(bug);
                    report.bug_iteration = Some(iteration);
                }
                if !self.config.full_exploration {
                    break;
                }
            }

            if result.outcome == IterationOutcome::Stopped {
                break;
            }
            if !lock(&self.strategy).prepare_for_next_iteration() {
                debug!("strategy exhausted after {} iteration(s)", iteration + 1);
                break;
            }
        }

        report.distinct_states = self.cache.distinct_states();
        report.elapsed = started.elapsed();
        info!(
            "run finished: {} iteration(s), {} distinct state(s), bug: {}",
            report.iterations,
            report.distinct_states,
            report.found_bug()
        );
        report
    }

    fn run_iteration<F>(
        &mut self,
        iteration: usize,
        timeout: Option<Duration>,
        scenario: Arc<F>,
    ) -> ScenarioResult
    where
        F: Fn(&mut EntityContext) -> Result<()> + Send + Sync + 'static,
    {
        debug!("iteration {} starting", iteration);
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&self.strategy)));
        ControlledRuntime::execute(scheduler, &self.config.monitors, timeout, move |root| {
            (scenario.as_ref())(root)
        })
    }

    /// Fold the iteration's fingerprints into coverage and decide whether it
    /// found a bug, running the liveness check on quiescent outcomes.
    fn evaluate_iteration(
        &mut self,
        iteration: usize,
        result: &ScenarioResult,
    ) -> Option<BugReport> {
        for (step, state) in result.steps.iter().enumerate() {
            let hot = state
                .monitors
                .iter()
                .any(|(_, temperature)| *temperature == Temperature::Hot);
            self.cache.observe(
                state.fingerprint,
                VisitMark {
                    iteration,
                    step,
                    hot,
                },
            );
        }

        if let Some(bug) = &result.bug {
            return Some(bug.clone());
        }

        let quiescent = matches!(
            result.outcome,
            IterationOutcome::Finished | IterationOutcome::StepBoundReached
        );
        if !quiescent {
            return None;
        }

        let mut checker = LivenessChecker::new();
        for state in &result.steps {
            checker.record(state.clone());
        }
        checker.check_at_quiescence().map(|witness| {
            BugReport::new(
                BugKind::Liveness,
                witness.to_string(),
                result.trace.clone(),
            )
        })
    }
}

/// Build the boxed strategy a config asks for.
fn build_strategy(config: &Config) -> Result<Box<dyn Strategy>> {
    let strategy: Box<dyn Strategy> = match &config.strategy {
        StrategyKind::Random => Box::new(RandomStrategy::new(config.seed, config.max_steps)),
        StrategyKind::ProbabilisticRandom { difficulty } => Box::new(
            ProbabilisticRandomStrategy::new(config.seed, *difficulty, config.max_steps),
        ),
        StrategyKind::Dfs => Box::new(DfsStrategy::new(config.max_steps)),
        StrategyKind::IterativeDeepeningDfs { initial_depth } => {
            if *initial_depth == 0 {
                return Err(InterleaveError::InvalidStrategy {
                    message: "iterative deepening needs a nonzero initial depth".to_string(),
                });
            }
            Box::new(IterativeDeepeningDfsStrategy::new(
                *initial_depth,
                config.max_steps,
            ))
        }
        StrategyKind::Pct {
            priority_change_points,
        } => Box::new(PctStrategy::new(
            config.seed,
            *priority_change_points,
            config.max_steps,
        )),
        StrategyKind::Pctcp {
            priority_change_points,
        } => Box::new(PctcpStrategy::new(
            config.seed,
            *priority_change_points,
            config.max_steps,
        )),
        StrategyKind::DelayBounding { delays } => Box::new(DelayBoundingStrategy::new(
            config.seed,
            *delays,
            config.max_steps,
        )),
        StrategyKind::OperationBounding {
            operation_delays,
            delays,
        } => Box::new(OperationBoundingStrategy::new(
            config.seed,
            *operation_delays,
            *delays,
            config.max_steps,
        )),
        StrategyKind::Replay { trace } => {
            if trace.is_empty() {
                return Err(InterleaveError::InvalidStrategy {
                    message: "cannot replay an empty trace".to_string(),
                });
            }
            Box::new(ReplayStrategy::new(trace.clone()))
        }
    };
    Ok(strategy)
}
