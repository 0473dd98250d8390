//! The cooperative bug-finding scheduler.
//!
//! Entities run on real threads, but only the one most recently chosen by
//! [`Scheduler::schedule`] may execute user code; every other entity is
//! parked on its own gate. `schedule` is the single synchronization point:
//! it consults the strategy, records the decision, wakes exactly one entity
//! and parks the caller. Trace, entity table and strategy state are only
//! touched by the thread currently inside a scheduler call, with the shared
//! mutex making that explicit.

use crate::entity::{EntityId, EntitySnapshot, EntityStatus, Operation};
use crate::error::{BugKind, BugReport, InterleaveError, Result};
use crate::strategy::Strategy;
use crate::trace::{Decision, Trace};
use log::debug;
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// How an iteration ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Still executing.
    Running,
    /// Every entity completed.
    Finished,
    /// The per-iteration scheduling step bound was reached.
    StepBoundReached,
    /// The strategy had no continuation to offer (search exhausted).
    Exhausted,
    /// A bug was recorded; see the scheduler's bug report.
    BugFound,
    /// Stopped from outside (timeout or explicit stop).
    Stopped,
}

/// Per-entity park/unpark signal.
struct Gate {
    active: bool,
    started: bool,
    cancelled: bool,
}

struct EntityHandle {
    id: EntityId,
    gate: Mutex<Gate>,
    cond: Condvar,
}

struct EntityRecord {
    handle: Arc<EntityHandle>,
    name: String,
    status: EntityStatus,
    operation: Operation,
    /// Operations executed so far; with the id this names the pending one.
    op_index: u64,
}

struct Shared {
    entities: BTreeMap<EntityId, EntityRecord>,
    next_id: u64,
    current: EntityId,
    trace: Trace,
    bug: Option<BugReport>,
    outcome: IterationOutcome,
}

impl Shared {
    fn running(&self) -> bool {
        self.outcome == IterationOutcome::Running
    }

    fn snapshots(&self) -> Vec<EntitySnapshot> {
        self.entities
            .values()
            .filter(|record| record.status != EntityStatus::Completed)
            .map(|record| EntitySnapshot {
                id: record.handle.id,
                status: record.status,
                operation: record.operation,
                op_index: record.op_index,
            })
            .collect()
    }
}

/// Mutex lock that survives a poisoned peer; scheduler state stays usable
/// for reporting even if an entity thread panicked at an awkward moment.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One iteration's cooperative gate. The strategy is shared with the engine
/// so its search state survives across iterations.
pub struct Scheduler {
    shared: Mutex<Shared>,
    strategy: Arc<Mutex<Box<dyn Strategy>>>,
    done: Condvar,
}

impl Scheduler {
    pub fn new(strategy: Arc<Mutex<Box<dyn Strategy>>>) -> Self {
        Scheduler {
            shared: Mutex::new(Shared {
                entities: BTreeMap::new(),
                next_id: 0,
                current: EntityId(0),
                trace: Trace::new(),
                bug: None,
                outcome: IterationOutcome::Running,
            }),
            strategy,
            done: Condvar::new(),
        }
    }

    /// Register a new entity. It will not run until chosen by `schedule`
    /// (or activated as the root).
    pub fn notify_created(&self, name: &str) -> EntityId {
        let mut shared = lock(&self.shared);
        let id = EntityId(shared.next_id);
        shared.next_id += 1;
        shared.entities.insert(
            id,
            EntityRecord {
                handle: Arc::new(EntityHandle {
                    id,
                    gate: Mutex::new(Gate {
                        active: false,
                        started: false,
                        cancelled: false,
                    }),
                    cond: Condvar::new(),
                }),
                name: name.to_string(),
                status: EntityStatus::Enabled,
                operation: Operation::start(),
                op_index: 0,
            },
        );
        debug!("created entity {} '{}'", id, name);
        id
    }

    /// Hand initial control to the given entity. Called once per iteration
    /// before any entity thread runs user code.
    pub fn activate_root(&self, id: EntityId) {
        let handle = {
            let mut shared = lock(&self.shared);
            shared.current = id;
            shared.entities[&id].handle.clone()
        };
        let mut gate = lock(&handle.gate);
        gate.active = true;
        handle.cond.notify_all();
    }

    /// Called by the entity's own thread before any user code; announces the
    /// first suspension point and parks until chosen.
    pub fn notify_started(&self, id: EntityId) -> Result<()> {
        let handle = self.handle_of(id)?;
        {
            let mut gate = lock(&handle.gate);
            gate.started = true;
            handle.cond.notify_all();
        }
        // An entity created after the iteration ended has a gate that the
        // finish pass never saw; it must not park on it.
        if !lock(&self.shared).running() {
            return Err(InterleaveError::Cancelled);
        }
        let mut gate = lock(&handle.gate);
        while !gate.active && !gate.cancelled {
            gate = handle
                .cond
                .wait(gate)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if gate.cancelled {
            return Err(InterleaveError::Cancelled);
        }
        Ok(())
    }

    /// Block the creator until the created entity has parked at its first
    /// suspension point. Without this, strategies could observe an entity
    /// count that a sleeping thread has yet to make real.
    pub fn wait_for_start(&self, id: EntityId) -> Result<()> {
        let handle = self.handle_of(id)?;
        let mut gate = lock(&handle.gate);
        while !gate.started && !gate.cancelled {
            gate = handle
                .cond
                .wait(gate)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if gate.cancelled {
            return Err(InterleaveError::Cancelled);
        }
        Ok(())
    }

    /// The single synchronization point. The caller announces its next
    /// pending operation, the strategy picks who runs, and the caller parks
    /// unless it was picked itself.
    pub fn schedule(&self, caller: EntityId, next_op: Operation) -> Result<()> {
        self.reschedule(caller, next_op, true)
    }

    /// Mark the entity as waiting for an event it has not received yet.
    pub fn notify_blocked_on_event(&self, id: EntityId) {
        let mut shared = lock(&self.shared);
        if let Some(record) = shared.entities.get_mut(&id) {
            record.status = EntityStatus::BlockedOnEvent;
        }
    }

    /// The event a blocked entity was waiting for has arrived.
    pub fn notify_received(&self, id: EntityId) {
        let mut shared = lock(&self.shared);
        if let Some(record) = shared.entities.get_mut(&id) {
            if record.status == EntityStatus::BlockedOnEvent {
                record.status = EntityStatus::Enabled;
            }
        }
    }

    /// The entity has halted. Control passes to whoever the strategy picks
    /// next; the caller's thread returns and exits.
    pub fn notify_completed(&self, id: EntityId) -> Result<()> {
        {
            let mut shared = lock(&self.shared);
            if let Some(record) = shared.entities.get_mut(&id) {
                record.status = EntityStatus::Completed;
                record.operation = Operation::stop();
                record.op_index += 1;
            }
            debug!("entity {} completed", id);
        }
        self.reschedule(id, Operation::stop(), false)
    }

    /// Resolve a nondeterministic boolean choice through the strategy.
    pub fn next_bool(&self, caller: EntityId, max_value: u64) -> Result<bool> {
        let mut shared = lock(&self.shared);
        if !shared.running() {
            return Err(InterleaveError::Cancelled);
        }
        if let Some(record) = shared.entities.get_mut(&caller) {
            record.status = EntityStatus::BlockedOnChoice;
        }
        let choice = lock(&self.strategy).next_bool(max_value);
        if let Some(record) = shared.entities.get_mut(&caller) {
            record.status = EntityStatus::Enabled;
        }
        match choice {
            Err(divergence) => {
                self.record_bug_locked(
                    &mut shared,
                    BugKind::Divergence,
                    divergence.to_string(),
                    Some(caller),
                );
                Err(InterleaveError::Cancelled)
            }
            Ok(None) => {
                self.finish_locked(&mut shared, IterationOutcome::Exhausted);
                Err(InterleaveError::Cancelled)
            }
            Ok(Some(value)) => {
                shared.trace.push(Decision::Bool(value));
                Ok(value)
            }
        }
    }

    /// Resolve a nondeterministic integer choice in [0, max_value).
    pub fn next_int(&self, caller: EntityId, max_value: u64) -> Result<u64> {
        let mut shared = lock(&self.shared);
        if !shared.running() {
            return Err(InterleaveError::Cancelled);
        }
        if let Some(record) = shared.entities.get_mut(&caller) {
            record.status = EntityStatus::BlockedOnChoice;
        }
        let choice = lock(&self.strategy).next_int(max_value);
        if let Some(record) = shared.entities.get_mut(&caller) {
            record.status = EntityStatus::Enabled;
        }
        match choice {
            Err(divergence) => {
                self.record_bug_locked(
                    &mut shared,
                    BugKind::Divergence,
                    divergence.to_string(),
                    Some(caller),
                );
                Err(InterleaveError::Cancelled)
            }
            Ok(None) => {
                self.finish_locked(&mut shared, IterationOutcome::Exhausted);
                Err(InterleaveError::Cancelled)
            }
            Ok(Some(value)) => {
                shared.trace.push(Decision::Int(value));
                Ok(value)
            }
        }
    }

    /// An assertion in user code failed; ends the iteration with a safety
    /// bug and unwinds the caller.
    pub fn notify_assertion_failure(&self, caller: EntityId, message: &str) -> Result<()> {
        let mut shared = lock(&self.shared);
        if !shared.running() {
            return Err(InterleaveError::Cancelled);
        }
        self.record_bug_locked(&mut shared, BugKind::Safety, message.to_string(), Some(caller));
        Err(InterleaveError::Cancelled)
    }

    /// User code escaped with a panic; reported like a safety violation.
    /// Called by the entity wrapper, which is already unwinding.
    pub fn notify_unhandled_fault(&self, entity: EntityId, message: &str) {
        let mut shared = lock(&self.shared);
        if !shared.running() {
            return;
        }
        self.record_bug_locked(&mut shared, BugKind::UnhandledFault, message.to_string(), Some(entity));
    }

    /// Force-stop the iteration (external cancellation or timeout). Not a
    /// bug; parked entities unwind with a cancellation error.
    pub fn stop(&self) {
        let mut shared = lock(&self.shared);
        if !shared.running() {
            return;
        }
        self.finish_locked(&mut shared, IterationOutcome::Stopped);
    }

    /// Block until the iteration finishes, or until the timeout passes.
    /// Returns the outcome at the moment of return.
    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> IterationOutcome {
        let shared = lock(&self.shared);
        match timeout {
            Some(timeout) => {
                let (shared, _) = self
                    .done
                    .wait_timeout_while(shared, timeout, |shared| shared.running())
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                shared.outcome
            }
            None => {
                let shared = self
                    .done
                    .wait_while(shared, |shared| shared.running())
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                shared.outcome
            }
        }
    }

    pub fn outcome(&self) -> IterationOutcome {
        lock(&self.shared).outcome
    }

    pub fn trace(&self) -> Trace {
        lock(&self.shared).trace.clone()
    }

    pub fn bug(&self) -> Option<BugReport> {
        lock(&self.shared).bug.clone()
    }

    fn handle_of(&self, id: EntityId) -> Result<Arc<EntityHandle>> {
        let shared = lock(&self.shared);
        shared
            .entities
            .get(&id)
            .map(|record| record.handle.clone())
            .ok_or(InterleaveError::Cancelled)
    }

    /// Core decision step shared by `schedule` and `notify_completed`.
    fn reschedule(&self, caller: EntityId, next_op: Operation, park_caller: bool) -> Result<()> {
        let (caller_handle, next_handle) = {
            let mut shared = lock(&self.shared);
            if !shared.running() {
                return Err(InterleaveError::Cancelled);
            }

            if park_caller {
                if let Some(record) = shared.entities.get_mut(&caller) {
                    record.operation = next_op;
                    record.op_index += 1;
                }
            }

            let mut strategy = lock(&self.strategy);
            if strategy.has_reached_max_steps() {
                debug!(
                    "step bound reached after {} steps",
                    strategy.scheduled_steps()
                );
                drop(strategy);
                self.finish_locked(&mut shared, IterationOutcome::StepBoundReached);
                return Err(InterleaveError::Cancelled);
            }

            let snapshots = shared.snapshots();
            let decision = strategy.next_entity(&snapshots, caller);
            drop(strategy);

            match decision {
                Err(divergence) => {
                    self.record_bug_locked(
                        &mut shared,
                        BugKind::Divergence,
                        divergence.to_string(),
                        Some(caller),
                    );
                    return Err(InterleaveError::Cancelled);
                }
                Ok(None) => {
                    return if snapshots.iter().any(|s| s.is_enabled()) {
                        self.finish_locked(&mut shared, IterationOutcome::Exhausted);
                        Err(InterleaveError::Cancelled)
                    } else if snapshots
                        .iter()
                        .any(|s| s.status == EntityStatus::BlockedOnEvent)
                    {
                        let blocked: Vec<String> = shared
                            .entities
                            .values()
                            .filter(|r| r.status == EntityStatus::BlockedOnEvent)
                            .map(|r| format!("'{}'", r.name))
                            .collect();
                        let message = format!(
                            "entity(s) {} are waiting to receive an event, but no entity is enabled",
                            blocked.join(", ")
                        );
                        self.record_bug_locked(&mut shared, BugKind::Deadlock, message, None);
                        Err(InterleaveError::Cancelled)
                    } else {
                        // Everyone completed; the iteration is over.
                        self.finish_locked(&mut shared, IterationOutcome::Finished);
                        if park_caller {
                            Err(InterleaveError::Cancelled)
                        } else {
                            Ok(())
                        }
                    };
                }
                Ok(Some(next_id)) => {
                    shared.trace.push(Decision::Schedule(next_id));
                    debug!("scheduled entity {}", next_id);
                    if next_id == caller {
                        return Ok(());
                    }
                    shared.current = next_id;
                    let caller_handle = shared.entities.get(&caller).map(|r| r.handle.clone());
                    let next_handle = shared.entities[&next_id].handle.clone();
                    (caller_handle, next_handle)
                }
            }
        };

        // Deactivate the caller before waking the next entity, so a wakeup
        // racing ahead of the park is never lost.
        if park_caller {
            if let Some(handle) = &caller_handle {
                lock(&handle.gate).active = false;
            }
        }

        {
            let mut gate = lock(&next_handle.gate);
            gate.active = true;
            next_handle.cond.notify_all();
        }

        if !park_caller {
            return Ok(());
        }

        let handle = match caller_handle {
            Some(handle) => handle,
            None => return Err(InterleaveError::Cancelled),
        };
        let mut gate = lock(&handle.gate);
        while !gate.active && !gate.cancelled {
            gate = handle
                .cond
                .wait(gate)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        if gate.cancelled {
            return Err(InterleaveError::Cancelled);
        }
        Ok(())
    }

    /// Record the first bug of the iteration and end it.
    fn record_bug_locked(
        &self,
        shared: &mut Shared,
        kind: BugKind,
        message: String,
        entity: Option<EntityId>,
    ) {
        if shared.bug.is_none() {
            let mut report = BugReport::new(kind, message, shared.trace.clone());
            if let Some(entity) = entity {
                report = report.with_entity(entity);
            }
            debug!("bug found: {}", report.kind);
            shared.bug = Some(report);
        }
        self.finish_locked(shared, IterationOutcome::BugFound);
    }

    /// End the iteration: cancel every parked entity and wake completion
    /// waiters.
    fn finish_locked(&self, shared: &mut Shared, outcome: IterationOutcome) {
        if !shared.running() {
            return;
        }
        shared.outcome = outcome;
        let handles: Vec<Arc<EntityHandle>> = shared
            .entities
            .values()
            .map(|record| record.handle.clone())
            .collect();
        for handle in handles {
            let mut gate = lock(&handle.gate);
            gate.cancelled = true;
            handle.cond.notify_all();
        }
        self.done.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::Seed;
    use crate::strategy::RandomStrategy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn strategy() -> Arc<Mutex<Box<dyn Strategy>>> {
        Arc::new(Mutex::new(
            Box::new(RandomStrategy::new(Seed::from_u64(1), 0)) as Box<dyn Strategy>,
        ))
    }

    /// Spawn an entity thread that starts, runs `body`, and completes.
    fn spawn_entity(
        scheduler: &Arc<Scheduler>,
        id: EntityId,
        body: impl FnOnce(&Scheduler, EntityId) -> Result<()> + Send + 'static,
    ) -> thread::JoinHandle<()> {
        let scheduler = Arc::clone(scheduler);
        thread::spawn(move || {
            let run = || -> Result<()> {
                scheduler.notify_started(id)?;
                body(&scheduler, id)?;
                scheduler.notify_completed(id)
            };
            // Cancellation is the normal unwind path at iteration end.
            let _ = run();
        })
    }

    #[test]
    fn test_exactly_one_entity_runs_at_a_time() {
        let scheduler = Arc::new(Scheduler::new(strategy()));
        let running = Arc::new(AtomicUsize::new(0));

        let ids: Vec<EntityId> = (0..3)
            .map(|i| scheduler.notify_created(&format!("worker-{}", i)))
            .collect();

        let mut threads = Vec::new();
        for &id in &ids {
            let running = Arc::clone(&running);
            threads.push(spawn_entity(&scheduler, id, move |scheduler, id| {
                for step in 0..10 {
                    let now = running.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(now, 0, "two entities ran concurrently");
                    running.fetch_sub(1, Ordering::SeqCst);
                    scheduler.schedule(id, Operation::send(id, step))?;
                }
                Ok(())
            }));
        }

        scheduler.activate_root(ids[0]);
        let outcome = scheduler.wait_for_completion(Some(Duration::from_secs(10)));
        assert_eq!(outcome, IterationOutcome::Finished);
        for thread in threads {
            thread.join().unwrap();
        }
        assert!(scheduler.bug().is_none());
    }

    #[test]
    fn test_deadlock_is_detected() {
        let scheduler = Arc::new(Scheduler::new(strategy()));
        let a = scheduler.notify_created("ping");
        let b = scheduler.notify_created("pong");

        let mut threads = Vec::new();
        for &id in &[a, b] {
            threads.push(spawn_entity(&scheduler, id, move |scheduler, id| {
                // Each waits for an event the other never sends.
                scheduler.notify_blocked_on_event(id);
                scheduler.schedule(id, Operation::receive(0))?;
                Ok(())
            }));
        }

        scheduler.activate_root(a);
        let outcome = scheduler.wait_for_completion(Some(Duration::from_secs(10)));
        assert_eq!(outcome, IterationOutcome::BugFound);
        for thread in threads {
            thread.join().unwrap();
        }

        let bug = scheduler.bug().unwrap();
        assert_eq!(bug.kind, BugKind::Deadlock);
        assert!(bug.message.contains("'ping'"));
        assert!(bug.message.contains("'pong'"));
    }

    #[test]
    fn test_assertion_failure_is_a_safety_bug() {
        let scheduler = Arc::new(Scheduler::new(strategy()));
        let a = scheduler.notify_created("asserter");
        let b = scheduler.notify_created("bystander");

        let t1 = spawn_entity(&scheduler, a, move |scheduler, id| {
            scheduler.schedule(id, Operation::send(id, 0))?;
            scheduler.notify_assertion_failure(id, "invariant broken")
        });
        let t2 = spawn_entity(&scheduler, b, move |scheduler, id| {
            loop {
                scheduler.schedule(id, Operation::send(id, 0))?;
            }
        });

        scheduler.activate_root(a);
        let outcome = scheduler.wait_for_completion(Some(Duration::from_secs(10)));
        assert_eq!(outcome, IterationOutcome::BugFound);
        t1.join().unwrap();
        t2.join().unwrap();

        let bug = scheduler.bug().unwrap();
        assert_eq!(bug.kind, BugKind::Safety);
        assert_eq!(bug.message, "invariant broken");
        assert_eq!(bug.entity, Some(a));
    }

    #[test]
    fn test_step_bound_forces_stop() {
        let bounded: Arc<Mutex<Box<dyn Strategy>>> = Arc::new(Mutex::new(Box::new(
            RandomStrategy::new(Seed::from_u64(1), 5),
        )));
        let scheduler = Arc::new(Scheduler::new(bounded));
        let a = scheduler.notify_created("spinner");

        let t = spawn_entity(&scheduler, a, move |scheduler, id| {
            loop {
                scheduler.schedule(id, Operation::send(id, 0))?;
            }
        });

        scheduler.activate_root(a);
        let outcome = scheduler.wait_for_completion(Some(Duration::from_secs(10)));
        assert_eq!(outcome, IterationOutcome::StepBoundReached);
        t.join().unwrap();
        assert!(scheduler.bug().is_none());
    }

    #[test]
    fn test_nondeterministic_choices_are_traced() {
        let scheduler = Arc::new(Scheduler::new(strategy()));
        let a = scheduler.notify_created("chooser");

        let t = spawn_entity(&scheduler, a, move |scheduler, id| {
            let _ = scheduler.next_bool(id, 2)?;
            let _ = scheduler.next_int(id, 10)?;
            Ok(())
        });

        scheduler.activate_root(a);
        let outcome = scheduler.wait_for_completion(Some(Duration::from_secs(10)));
        assert_eq!(outcome, IterationOutcome::Finished);
        t.join().unwrap();

        let trace = scheduler.trace();
        assert!(trace
            .decisions()
            .iter()
            .any(|d| matches!(d, Decision::Bool(_))));
        assert!(trace
            .decisions()
            .iter()
            .any(|d| matches!(d, Decision::Int(_))));
    }

    #[test]
    fn test_external_stop_cancels_blocked_entities() {
        let scheduler = Arc::new(Scheduler::new(strategy()));
        let a = scheduler.notify_created("waiter");

        let t = spawn_entity(&scheduler, a, move |scheduler, id| {
            loop {
                scheduler.schedule(id, Operation::send(id, 0))?;
            }
        });

        scheduler.activate_root(a);
        thread::sleep(Duration::from_millis(20));
        scheduler.stop();
        assert_eq!(
            scheduler.wait_for_completion(Some(Duration::from_secs(10))),
            IterationOutcome::Stopped
        );
        t.join().unwrap();
    }
}
