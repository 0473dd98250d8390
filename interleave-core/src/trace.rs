//! Append-only decision traces and their line-oriented text format.
//!
//! A trace is the complete record of one iteration: every scheduling choice
//! and every nondeterministic value, in order. Serializing it and feeding it
//! to the replay strategy reproduces the iteration decision for decision.

use crate::entity::EntityId;
use crate::error::InterleaveError;
use std::fmt;

/// One recorded decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The entity chosen to run at a scheduling point.
    Schedule(EntityId),
    /// A nondeterministic boolean choice.
    Bool(bool),
    /// A nondeterministic integer choice.
    Int(u64),
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Schedule(id) => write!(f, "sch {}", id),
            Decision::Bool(value) => write!(f, "bool {}", value),
            Decision::Int(value) => write!(f, "int {}", value),
        }
    }
}

/// Ordered sequence of decisions for one iteration. Append-only while the
/// iteration runs; immutable once handed to a bug report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace {
    decisions: Vec<Decision>,
}

impl Trace {
    pub fn new() -> Self {
        Trace {
            decisions: Vec::new(),
        }
    }

    pub fn push(&mut self, decision: Decision) {
        self.decisions.push(decision);
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Decision> {
        self.decisions.get(index).copied()
    }

    pub fn decisions(&self) -> &[Decision] {
        &self.decisions
    }

    /// Serialize as text, one decision per line.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for decision in &self.decisions {
            out.push_str(&decision.to_string());
            out.push('\n');
        }
        out
    }

    /// Parse the text format produced by [`Trace::to_text`]. Blank lines and
    /// lines starting with `#` are skipped.
    pub fn parse(text: &str) -> Result<Trace, InterleaveError> {
        let mut trace = Trace::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let malformed = || InterleaveError::TraceParse {
                line: index + 1,
                content: line.to_string(),
            };

            let (tag, value) = line.split_once(' ').ok_or_else(malformed)?;
            let decision = match tag {
                "sch" => {
                    let id = value.parse::<u64>().map_err(|_| malformed())?;
                    Decision::Schedule(EntityId(id))
                }
                "bool" => {
                    let value = value.parse::<bool>().map_err(|_| malformed())?;
                    Decision::Bool(value)
                }
                "int" => {
                    let value = value.parse::<u64>().map_err(|_| malformed())?;
                    Decision::Int(value)
                }
                _ => return Err(malformed()),
            };
            trace.push(decision);
        }
        Ok(trace)
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_text())
    }
}
