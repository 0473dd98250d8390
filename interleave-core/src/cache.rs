//! Program-state fingerprinting and the visited-state cache.
//!
//! A fingerprint summarizes the whole program configuration. Per-component
//! contributions are combined with a commutative operator, so the order in
//! which entities are enumerated never changes the result.

use std::collections::HashMap;
use std::fmt;

/// Order-independent hash of the global program configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Rolling accumulator for one component's local-state contribution.
///
/// Order matters within a single component (its fields form a sequence); the
/// commutativity requirement applies only across components.
#[derive(Debug, Clone, Copy)]
pub struct StateHasher(u64);

impl StateHasher {
    pub fn new() -> Self {
        StateHasher(19)
    }

    pub fn add(&mut self, value: u64) {
        self.0 = self.0.wrapping_mul(31).wrapping_add(value);
    }

    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for StateHasher {
    fn default() -> Self {
        StateHasher::new()
    }
}

/// Combine per-component contributions into a program fingerprint.
///
/// Wrapping addition of scaled contributions is commutative and associative,
/// so `[a, b]` and `[b, a]` fingerprint identically. The component count is
/// folded in at the end; zero-valued contributions would otherwise leave the
/// sum untouched and collapse configurations of different sizes.
pub fn program_fingerprint(contributions: impl IntoIterator<Item = u64>) -> Fingerprint {
    let mut hash: u64 = 19;
    let mut count: u64 = 0;
    for contribution in contributions {
        hash = hash.wrapping_add(contribution.wrapping_mul(31));
        count += 1;
    }
    Fingerprint(hash.wrapping_mul(31).wrapping_add(count))
}

/// What was true of a program state the first time it was visited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisitMark {
    pub iteration: usize,
    pub step: usize,
    /// Whether any monitor was hot at that visit.
    pub hot: bool,
}

/// Tracks which program configurations have been visited. Reset per
/// iteration.
#[derive(Debug, Default)]
pub struct StateCache {
    visited: HashMap<Fingerprint, VisitMark>,
}

impl StateCache {
    pub fn new() -> Self {
        StateCache {
            visited: HashMap::new(),
        }
    }

    /// Record a visit. Returns true if the state was new; an already-known
    /// state keeps its original mark.
    pub fn observe(&mut self, fingerprint: Fingerprint, mark: VisitMark) -> bool {
        use std::collections::hash_map::Entry;
        match self.visited.entry(fingerprint) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(mark);
                true
            }
        }
    }

    pub fn contains(&self, fingerprint: Fingerprint) -> bool {
        self.visited.contains_key(&fingerprint)
    }

    pub fn mark(&self, fingerprint: Fingerprint) -> Option<VisitMark> {
        self.visited.get(&fingerprint).copied()
    }

    /// Number of distinct program states seen so far.
    pub fn distinct_states(&self) -> usize {
        self.visited.len()
    }

    pub fn clear(&mut self) {
        self.visited.clear();
    }
}
