//! Exhaustive depth-first search over scheduling and nondeterministic
//! choices, with iterative deepening on top.
//!
//! The stacks hold one level per choice point along the current path. A
//! choice marked done while the iteration runs means "taken on this path";
//! backtracking in `prepare_for_next_iteration` converts that into
//! "exhausted" as subtrees complete, pruning finished levels so the next
//! iteration walks the leftmost unexplored path.

use crate::entity::{EntityId, EntitySnapshot};
use crate::strategy::{enabled, Divergence, Strategy};

#[derive(Debug, Clone, Copy)]
struct SchChoice {
    id: EntityId,
    done: bool,
}

#[derive(Debug, Clone, Copy)]
struct BoolChoice {
    value: bool,
    done: bool,
}

#[derive(Debug, Clone, Copy)]
struct IntChoice {
    value: u64,
    done: bool,
}

/// Depth-first exploration that visits every distinct interleaving (up to
/// the deterministic by-id candidate ordering) exactly once.
#[derive(Debug)]
pub struct DfsStrategy {
    max_steps: usize,
    steps: usize,
    sch_index: usize,
    nondet_index: usize,
    schedule_stack: Vec<Vec<SchChoice>>,
    bool_stack: Vec<Vec<BoolChoice>>,
    int_stack: Vec<Vec<IntChoice>>,
}

impl DfsStrategy {
    pub fn new(max_steps: usize) -> Self {
        DfsStrategy {
            max_steps,
            steps: 0,
            sch_index: 0,
            nondet_index: 0,
            schedule_stack: Vec::new(),
            bool_stack: Vec::new(),
            int_stack: Vec::new(),
        }
    }

    /// True once every choice on every recorded level is exhausted. All
    /// three stacks count; a program may branch only on nondeterministic
    /// choices and never record a contested scheduling point.
    pub fn has_finished(&self) -> bool {
        let explored = !self.schedule_stack.is_empty()
            || !self.bool_stack.is_empty()
            || !self.int_stack.is_empty();
        explored
            && all_done(&self.schedule_stack, |c| c.done)
            && all_done(&self.bool_stack, |c| c.done)
            && all_done(&self.int_stack, |c| c.done)
    }

    fn backtrack_bool_stack(&mut self) {
        let mut idx = self.bool_stack.len();
        while idx > 1 {
            idx -= 1;
            if !self.bool_stack[idx].iter().all(|c| c.done) {
                break;
            }
            if let Some(previous) = self.bool_stack[idx - 1].iter_mut().find(|c| !c.done) {
                previous.done = true;
            }
            self.bool_stack.remove(idx);
        }
    }

    fn backtrack_int_stack(&mut self) {
        let mut idx = self.int_stack.len();
        while idx > 1 {
            idx -= 1;
            if !self.int_stack[idx].iter().all(|c| c.done) {
                break;
            }
            if let Some(previous) = self.int_stack[idx - 1].iter_mut().find(|c| !c.done) {
                previous.done = true;
            }
            self.int_stack.remove(idx);
        }
    }
}

fn all_done<T>(stack: &[Vec<T>], done: impl Fn(&T) -> bool) -> bool {
    stack.iter().all(|level| level.iter().all(&done))
}

impl Strategy for DfsStrategy {
    fn next_entity(
        &mut self,
        candidates: &[EntitySnapshot],
        _current: EntityId,
    ) -> Result<Option<EntityId>, Divergence> {
        let enabled = enabled(candidates);
        if enabled.is_empty() {
            return Ok(None);
        }

        if self.sch_index >= self.schedule_stack.len() {
            let level = enabled
                .iter()
                .map(|c| SchChoice {
                    id: c.id,
                    done: false,
                })
                .collect();
            self.schedule_stack.push(level);
        }

        let position = match self.schedule_stack[self.sch_index]
            .iter()
            .position(|c| !c.done)
        {
            Some(position) => position,
            None => return Ok(None),
        };

        // Only the deepest taken choice stays marked while descending; the
        // parent's mark is restored during backtracking.
        if self.sch_index > 0 {
            if let Some(previous) = self.schedule_stack[self.sch_index - 1]
                .iter_mut()
                .rev()
                .find(|c| c.done)
            {
                previous.done = false;
            }
        }

        let chosen = {
            let level = &mut self.schedule_stack[self.sch_index];
            level[position].done = true;
            level[position].id
        };
        self.sch_index += 1;

        if !enabled.iter().any(|c| c.id == chosen) {
            return Ok(None);
        }

        self.steps += 1;
        Ok(Some(chosen))
    }

    fn next_bool(&mut self, _max_value: u64) -> Result<Option<bool>, Divergence> {
        if self.nondet_index >= self.bool_stack.len() {
            self.bool_stack.push(vec![
                BoolChoice {
                    value: false,
                    done: false,
                },
                BoolChoice {
                    value: true,
                    done: false,
                },
            ]);
        }

        let position = match self.bool_stack[self.nondet_index]
            .iter()
            .position(|c| !c.done)
        {
            Some(position) => position,
            None => return Ok(None),
        };

        if self.nondet_index > 0 {
            if let Some(previous) = self.bool_stack[self.nondet_index - 1]
                .iter_mut()
                .rev()
                .find(|c| c.done)
            {
                previous.done = false;
            }
        }

        let value = {
            let level = &mut self.bool_stack[self.nondet_index];
            level[position].done = true;
            level[position].value
        };
        self.nondet_index += 1;
        self.steps += 1;
        Ok(Some(value))
    }

    fn next_int(&mut self, max_value: u64) -> Result<Option<u64>, Divergence> {
        if self.nondet_index >= self.int_stack.len() {
            let level = (0..max_value)
                .map(|value| IntChoice { value, done: false })
                .collect();
            self.int_stack.push(level);
        }

        let position = match self.int_stack[self.nondet_index]
            .iter()
            .position(|c| !c.done)
        {
            Some(position) => position,
            None => return Ok(None),
        };

        if self.nondet_index > 0 {
            if let Some(previous) = self.int_stack[self.nondet_index - 1]
                .iter_mut()
                .rev()
                .find(|c| c.done)
            {
                previous.done = false;
            }
        }

        let value = {
            let level = &mut self.int_stack[self.nondet_index];
            level[position].done = true;
            level[position].value
        };
        self.nondet_index += 1;
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
        self.steps = 0;
        self.sch_index = 0;
        self.nondet_index = 0;

        self.backtrack_bool_stack();
        self.backtrack_int_stack();

        let nondet_exhausted = all_done(&self.bool_stack, |c| c.done)
            && all_done(&self.int_stack, |c| c.done);

        if nondet_exhausted {
            let mut idx = self.schedule_stack.len();
            while idx > 1 {
                idx -= 1;
                if !self.schedule_stack[idx].iter().all(|c| c.done) {
                    break;
                }
                if let Some(previous) =
                    self.schedule_stack[idx - 1].iter_mut().find(|c| !c.done)
                {
                    previous.done = true;
                }
                self.schedule_stack.remove(idx);
            }
            // Exhaustion only becomes visible after pruning converts the
            // deepest taken choices into finished subtrees.
            if self.has_finished() {
                return false;
            }
            // The next schedule path gets fresh nondeterministic subtrees.
            self.bool_stack.clear();
            self.int_stack.clear();
        } else if let Some(last) = self.schedule_stack.last_mut() {
            if let Some(previous) = last.iter_mut().rev().find(|c| c.done) {
                previous.done = false;
            }
        }

        true
    }

    fn reset(&mut self) {
        self.schedule_stack.clear();
        self.bool_stack.clear();
        self.int_stack.clear();
        self.sch_index = 0;
        self.nondet_index = 0;
        self.steps = 0;
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
        "dfs".to_string()
    }
}

/// Depth-first search restarted with a growing depth bound, for spaces too
/// large to enumerate outright.
#[derive(Debug)]
pub struct IterativeDeepeningDfsStrategy {
    dfs: DfsStrategy,
    initial_depth: usize,
    current_depth: usize,
    max_depth: usize,
}

impl IterativeDeepeningDfsStrategy {
    pub fn new(initial_depth: usize, max_depth: usize) -> Self {
        IterativeDeepeningDfsStrategy {
            dfs: DfsStrategy::new(initial_depth),
            initial_depth,
            current_depth: initial_depth,
            max_depth,
        }
    }

    pub fn current_depth(&self) -> usize {
        self.current_depth
    }
}

impl Strategy for IterativeDeepeningDfsStrategy {
    fn next_entity(
        &mut self,
        candidates: &[EntitySnapshot],
        current: EntityId,
    ) -> Result<Option<EntityId>, Divergence> {
        self.dfs.next_entity(candidates, current)
    }

    fn next_bool(&mut self, max_value: u64) -> Result<Option<bool>, Divergence> {
        self.dfs.next_bool(max_value)
    }

    fn next_int(&mut self, max_value: u64) -> Result<Option<u64>, Divergence> {
        self.dfs.next_int(max_value)
    }

    fn force_next(&mut self, next: EntityId, candidates: &[EntitySnapshot], current: EntityId) {
        self.dfs.force_next(next, candidates, current);
    }

    fn force_next_bool(&mut self, next: bool) {
        self.dfs.force_next_bool(next);
    }

    fn force_next_int(&mut self, next: u64) {
        self.dfs.force_next_int(next);
    }

    fn prepare_for_next_iteration(&mut self) -> bool {
        if self.dfs.prepare_for_next_iteration() {
            return true;
        }
        // Exhausted at this depth; widen and start over.
        self.current_depth += self.initial_depth;
        if self.current_depth > self.max_depth {
            return false;
        }
        self.dfs.reset();
        self.dfs.max_steps = self.current_depth;
        true
    }

    fn reset(&mut self) {
        self.current_depth = self.initial_depth;
        self.dfs.reset();
        self.dfs.max_steps = self.current_depth;
    }

    fn scheduled_steps(&self) -> usize {
        self.dfs.scheduled_steps()
    }

    fn has_reached_max_steps(&self) -> bool {
        self.dfs.has_reached_max_steps()
    }

    fn is_fair(&self) -> bool {
        false
    }

    fn description(&self) -> String {
        format!(
            "iterative deepening dfs (depth {} of {})",
            self.current_depth, self.max_depth
        )
    }
}
