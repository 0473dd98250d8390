//! Controlled actor runtime that hosts a system under test.
//!
//! Entities are closures on OS threads, driven through an [`EntityContext`]
//! whose operations (spawn, send, receive, choices, assertions) all funnel
//! through the scheduler, so every interleaving point is a strategy
//! decision. Mailboxes, entity state identities and monitor states live
//! here; after every operation the runtime records a program fingerprint
//! for coverage and liveness checking.

use interleave_core::cache::{program_fingerprint, StateHasher};
use interleave_core::entity::{EntityId, Operation};
use interleave_core::error::{BugReport, InterleaveError, Result};
use interleave_core::liveness::{MonitorId, StepState, Temperature};
use interleave_core::scheduler::{IterationOutcome, Scheduler};
use interleave_core::trace::Trace;
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A liveness monitor definition: named states, some flagged hot (progress
/// obligation pending) or cold (obligation met).
#[derive(Debug, Clone)]
pub struct MonitorDef {
    pub name: String,
    pub initial: String,
    pub hot: Vec<String>,
    pub cold: Vec<String>,
}

impl MonitorDef {
    pub fn new(name: impl Into<String>, initial: impl Into<String>) -> Self {
        MonitorDef {
            name: name.into(),
            initial: initial.into(),
            hot: Vec::new(),
            cold: Vec::new(),
        }
    }

    pub fn hot(mut self, state: impl Into<String>) -> Self {
        self.hot.push(state.into());
        self
    }

    pub fn cold(mut self, state: impl Into<String>) -> Self {
        self.cold.push(state.into());
        self
    }
}

#[derive(Debug, Clone)]
struct Message {
    payload: u64,
    match_index: u64,
}

struct MonitorState {
    def: MonitorDef,
    current: String,
}

impl MonitorState {
    fn temperature(&self) -> Temperature {
        if self.def.hot.contains(&self.current) {
            Temperature::Hot
        } else if self.def.cold.contains(&self.current) {
            Temperature::Cold
        } else {
            Temperature::Neutral
        }
    }

    fn state_hash(&self) -> u64 {
        string_hash(&self.current)
    }
}

fn string_hash(value: &str) -> u64 {
    let mut hasher = StateHasher::new();
    for byte in value.bytes() {
        hasher.add(byte as u64);
    }
    hasher.finish()
}

struct RuntimeShared {
    mailboxes: HashMap<EntityId, VecDeque<Message>>,
    entity_states: HashMap<EntityId, u64>,
    monitors: Vec<MonitorState>,
    next_match: u64,
    steps: Vec<StepState>,
}

impl RuntimeShared {
    /// Commutative fingerprint of the whole configuration, plus the monitor
    /// temperatures at this step.
    fn record_step(&mut self) {
        let entity_contributions = self.entity_states.iter().map(|(id, state)| {
            let mut hasher = StateHasher::new();
            hasher.add(id.0);
            hasher.add(*state);
            if let Some(mailbox) = self.mailboxes.get(id) {
                hasher.add(mailbox.len() as u64);
                for message in mailbox {
                    hasher.add(message.payload);
                }
            }
            hasher.finish()
        });
        let monitor_contributions = self.monitors.iter().enumerate().map(|(index, monitor)| {
            let mut hasher = StateHasher::new();
            hasher.add(index as u64);
            hasher.add(monitor.state_hash());
            hasher.finish()
        });
        let fingerprint =
            program_fingerprint(entity_contributions.chain(monitor_contributions));
        let monitors = self
            .monitors
            .iter()
            .enumerate()
            .map(|(index, monitor)| (MonitorId(index as u64), monitor.temperature()))
            .collect();
        self.steps.push(StepState {
            fingerprint,
            monitors,
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One iteration's runtime. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct ControlledRuntime {
    scheduler: Arc<Scheduler>,
    shared: Arc<Mutex<RuntimeShared>>,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// What one executed iteration produced.
#[derive(Debug)]
pub struct ScenarioResult {
    pub outcome: IterationOutcome,
    pub bug: Option<BugReport>,
    pub trace: Trace,
    /// Per-step program fingerprints and monitor temperatures, for coverage
    /// accounting and the liveness check.
    pub steps: Vec<StepState>,
}

impl ControlledRuntime {
    /// Execute one iteration: the scenario closure runs as the root entity
    /// and spawns the rest of the system under test through its context.
    pub fn execute<F>(
        scheduler: Arc<Scheduler>,
        monitors: &[MonitorDef],
        timeout: Option<Duration>,
        scenario: F,
    ) -> ScenarioResult
    where
        F: FnOnce(&mut EntityContext) -> Result<()> + Send + 'static,
    {
        let runtime = ControlledRuntime {
            scheduler: Arc::clone(&scheduler),
            shared: Arc::new(Mutex::new(RuntimeShared {
                mailboxes: HashMap::new(),
                entity_states: HashMap::new(),
                monitors: monitors
                    .iter()
                    .map(|def| MonitorState {
                        def: def.clone(),
                        current: def.initial.clone(),
                    })
                    .collect(),
                next_match: 0,
                steps: Vec::new(),
            })),
            threads: Arc::new(Mutex::new(Vec::new())),
        };

        let root = runtime.register("root");
        runtime.spawn_thread(root, scenario);
        scheduler.activate_root(root);

        let mut outcome = scheduler.wait_for_completion(timeout);
        if outcome == IterationOutcome::Running {
            debug!("iteration timed out; forcing stop");
            scheduler.stop();
            outcome = scheduler.wait_for_completion(None);
        }

        // Cancellation has been signalled; every entity thread unwinds.
        loop {
            let handle = lock(&runtime.threads).pop();
            match handle {
                Some(handle) => {
                    let _ = handle.join();
                }
                None => break,
            }
        }

        let steps = {
            let mut shared = lock(&runtime.shared);
            std::mem::take(&mut shared.steps)
        };

        ScenarioResult {
            outcome,
            bug: scheduler.bug(),
            trace: scheduler.trace(),
            steps,
        }
    }

    fn register(&self, name: &str) -> EntityId {
        let id = self.scheduler.notify_created(name);
        let mut shared = lock(&self.shared);
        shared.mailboxes.insert(id, VecDeque::new());
        shared.entity_states.insert(id, 0);
        id
    }

    fn spawn_thread<F>(&self, id: EntityId, body: F)
    where
        F: FnOnce(&mut EntityContext) -> Result<()> + Send + 'static,
    {
        let runtime = self.clone();
        let handle = thread::spawn(move || {
            let mut context = EntityContext {
                runtime: runtime.clone(),
                id,
            };
            if runtime.scheduler.notify_started(id).is_err() {
                return;
            }
            match panic::catch_unwind(AssertUnwindSafe(|| body(&mut context))) {
                Ok(Ok(())) => {
                    let _ = runtime.scheduler.notify_completed(id);
                }
                Ok(Err(InterleaveError::Cancelled)) => {
                    // Cancelled mid-iteration; nothing more to report.
                }
                Ok(Err(error)) => {
                    // Any other error would leave the entity registered but
                    // dead, stalling the iteration; report it instead.
                    runtime.scheduler.notify_unhandled_fault(id, &error.to_string());
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    runtime.scheduler.notify_unhandled_fault(id, &message);
                }
            }
        });
        lock(&self.threads).push(handle);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "entity panicked".to_string()
    }
}

/// Handle an entity's closure uses for every interleaving operation.
pub struct EntityContext {
    runtime: ControlledRuntime,
    id: EntityId,
}

impl EntityContext {
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Create a child entity running `body`. Blocks until the child has
    /// parked at its first suspension point.
    pub fn spawn<F>(&mut self, name: &str, body: F) -> Result<EntityId>
    where
        F: FnOnce(&mut EntityContext) -> Result<()> + Send + 'static,
    {
        let child = self.runtime.register(name);
        self.runtime.spawn_thread(child, body);
        self.runtime.scheduler.wait_for_start(child)?;
        self.runtime
            .scheduler
            .schedule(self.id, Operation::create(child))?;
        lock(&self.runtime.shared).record_step();
        Ok(child)
    }

    /// Send a payload to another entity's mailbox.
    pub fn send(&mut self, target: EntityId, payload: u64) -> Result<()> {
        let match_index = {
            let mut shared = lock(&self.runtime.shared);
            let match_index = shared.next_match;
            shared.next_match += 1;
            match_index
        };
        self.runtime
            .scheduler
            .schedule(self.id, Operation::send(target, match_index))?;
        {
            let mut shared = lock(&self.runtime.shared);
            match shared.mailboxes.get_mut(&target) {
                Some(mailbox) => mailbox.push_back(Message {
                    payload,
                    match_index,
                }),
                None => return Err(InterleaveError::Cancelled),
            }
            shared.record_step();
        }
        self.runtime.scheduler.notify_received(target);
        Ok(())
    }

    /// Receive the next payload, blocking (in scheduler terms) until one is
    /// available.
    pub fn receive(&mut self) -> Result<u64> {
        loop {
            let pending = lock(&self.runtime.shared)
                .mailboxes
                .get(&self.id)
                .and_then(|mailbox| mailbox.front().cloned());

            match pending {
                Some(message) => {
                    self.runtime
                        .scheduler
                        .schedule(self.id, Operation::receive(message.match_index))?;
                    let mut shared = lock(&self.runtime.shared);
                    if let Some(mailbox) = shared.mailboxes.get_mut(&self.id) {
                        mailbox.pop_front();
                    }
                    shared.record_step();
                    return Ok(message.payload);
                }
                None => {
                    self.runtime.scheduler.notify_blocked_on_event(self.id);
                    self.runtime
                        .scheduler
                        .schedule(self.id, Operation::receive(0))?;
                }
            }
        }
    }

    /// Nondeterministic boolean choice, resolved by the strategy.
    pub fn choose_bool(&mut self) -> Result<bool> {
        self.runtime.scheduler.next_bool(self.id, 2)
    }

    /// Nondeterministic integer choice in [0, max_value).
    pub fn choose_int(&mut self, max_value: u64) -> Result<u64> {
        self.runtime.scheduler.next_int(self.id, max_value)
    }

    /// Assert a condition; a false condition ends the iteration with a
    /// safety bug.
    pub fn assert_true(&mut self, condition: bool, message: &str) -> Result<()> {
        if condition {
            Ok(())
        } else {
            self.runtime
                .scheduler
                .notify_assertion_failure(self.id, message)
        }
    }

    /// Update this entity's local state identity used in fingerprints.
    pub fn set_state(&mut self, state: u64) {
        let mut shared = lock(&self.runtime.shared);
        shared.entity_states.insert(self.id, state);
    }

    /// Transition a monitor to a named state.
    pub fn monitor_goto(&mut self, monitor: &str, state: &str) -> Result<()> {
        let mut shared = lock(&self.runtime.shared);
        let found = shared
            .monitors
            .iter_mut()
            .find(|m| m.def.name == monitor);
        match found {
            Some(m) => {
                m.current = state.to_string();
                shared.record_step();
                Ok(())
            }
            None => Err(InterleaveError::InvalidConfig {
                message: format!("unknown monitor '{}'", monitor),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interleave_core::error::BugKind;
    use interleave_core::rng::Seed;
    use interleave_core::strategy::{RandomStrategy, Strategy};

    fn scheduler() -> Arc<Scheduler> {
        let strategy: Arc<Mutex<Box<dyn Strategy>>> = Arc::new(Mutex::new(Box::new(
            RandomStrategy::new(Seed::from_u64(1), 1000),
        )));
        Arc::new(Scheduler::new(strategy))
    }

    #[test]
    fn test_message_round_trip() {
        let result = ControlledRuntime::execute(
            scheduler(),
            &[],
            Some(Duration::from_secs(10)),
            |root| {
                let consumer = root.spawn("consumer", |ctx| {
                    let value = ctx.receive()?;
                    ctx.assert_true(value == 17, "unexpected payload")?;
                    Ok(())
                })?;
                root.send(consumer, 17)?;
                Ok(())
            },
        );
        assert_eq!(result.outcome, IterationOutcome::Finished);
        assert!(result.bug.is_none());
        assert!(!result.trace.is_empty());
        assert!(!result.steps.is_empty());
    }

    #[test]
    fn test_failed_assertion_surfaces_as_safety_bug() {
        let result = ControlledRuntime::execute(
            scheduler(),
            &[],
            Some(Duration::from_secs(10)),
            |root| {
                root.assert_true(false, "always fails")?;
                Ok(())
            },
        );
        let bug = result.bug.unwrap();
        assert_eq!(bug.kind, BugKind::Safety);
        assert_eq!(bug.message, "always fails");
    }

    #[test]
    fn test_mutual_receive_deadlocks() {
        let result = ControlledRuntime::execute(
            scheduler(),
            &[],
            Some(Duration::from_secs(10)),
            |root| {
                let left = root.spawn("left", |ctx| {
                    ctx.receive()?;
                    Ok(())
                })?;
                let right = root.spawn("right", |ctx| {
                    ctx.receive()?;
                    Ok(())
                })?;
                let _ = (left, right);
                Ok(())
            },
        );
        let bug = result.bug.unwrap();
        assert_eq!(bug.kind, BugKind::Deadlock);
        assert!(bug.message.contains("'left'"));
        assert!(bug.message.contains("'right'"));
    }

    #[test]
    fn test_panic_is_an_unhandled_fault() {
        let result = ControlledRuntime::execute(
            scheduler(),
            &[],
            Some(Duration::from_secs(10)),
            |root| {
                root.spawn("bomb", |_ctx| panic!("boom"))?;
                Ok(())
            },
        );
        let bug = result.bug.unwrap();
        assert_eq!(bug.kind, BugKind::UnhandledFault);
        assert!(bug.message.contains("boom"));
    }

    #[test]
    fn test_unknown_monitor_error_ends_the_iteration() {
        let result = ControlledRuntime::execute(
            scheduler(),
            &[],
            Some(Duration::from_secs(10)),
            |root| {
                root.monitor_goto("missing", "anywhere")?;
                Ok(())
            },
        );
        let bug = result.bug.unwrap();
        assert_eq!(bug.kind, BugKind::UnhandledFault);
        assert!(bug.message.contains("unknown monitor 'missing'"));
    }

    #[test]
    fn test_monitor_transitions_are_recorded() {
        let monitor = MonitorDef::new("progress", "waiting")
            .hot("waiting")
            .cold("done");
        let result = ControlledRuntime::execute(
            scheduler(),
            &[monitor],
            Some(Duration::from_secs(10)),
            |root| {
                root.monitor_goto("progress", "done")?;
                Ok(())
            },
        );
        assert!(result.bug.is_none());
        let last = result.steps.last().unwrap();
        assert_eq!(last.monitors[0].1, Temperature::Cold);
    }
}
