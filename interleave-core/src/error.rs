//! Error types and bug reports for systematic concurrency testing.

use crate::entity::EntityId;
use crate::trace::Trace;
use std::fmt;
use thiserror::Error;

/// Fatal errors surfaced to the caller, as opposed to bugs found in the
/// system under test (those are [`BugReport`] values, not errors).
#[derive(Error, Debug)]
pub enum InterleaveError {
    /// A serialized trace could not be parsed.
    #[error("failed to parse trace at line {line}: '{content}'")]
    TraceParse { line: usize, content: String },

    /// Invalid engine configuration.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// A strategy was constructed with unusable parameters.
    #[error("invalid strategy parameter: {message}")]
    InvalidStrategy { message: String },

    /// The current iteration was cancelled; entity call stacks unwind on
    /// this, it never reaches the caller as a failure.
    #[error("execution cancelled")]
    Cancelled,
}

/// Result type alias for interleave operations.
pub type Result<T> = std::result::Result<T, InterleaveError>;

/// Classification of a found bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BugKind {
    /// An assertion in the system under test failed.
    Safety,
    /// No entity is enabled but some entity still waits for an event.
    Deadlock,
    /// A hot monitor cycle: the program can run forever without meeting a
    /// progress obligation.
    Liveness,
    /// User code raised an unexpected error at the entity boundary.
    UnhandledFault,
    /// A recorded trace could not be reproduced against the live run.
    Divergence,
}

impl fmt::Display for BugKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BugKind::Safety => write!(f, "safety violation"),
            BugKind::Deadlock => write!(f, "deadlock"),
            BugKind::Liveness => write!(f, "liveness violation"),
            BugKind::UnhandledFault => write!(f, "unhandled fault"),
            BugKind::Divergence => write!(f, "divergence"),
        }
    }
}

/// One found bug: its kind, a human-readable message, the entity that was
/// running when it was detected (where that is meaningful), and the decision
/// trace that reproduces it.
#[derive(Debug, Clone)]
pub struct BugReport {
    pub kind: BugKind,
    pub message: String,
    pub entity: Option<EntityId>,
    pub trace: Trace,
}

impl BugReport {
    pub fn new(kind: BugKind, message: impl Into<String>, trace: Trace) -> Self {
        BugReport {
            kind,
            message: message.into(),
            entity: None,
            trace,
        }
    }

    pub fn with_entity(mut self, entity: EntityId) -> Self {
        self.entity = Some(entity);
        self
    }
}

impl fmt::Display for BugReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(entity) = self.entity {
            write!(f, " (entity {})", entity)?;
        }
        writeln!(f)?;
        writeln!(f, "  found after {} decision(s)", self.trace.len())?;
        writeln!(f, "  reproducing trace:")?;
        for line in self.trace.to_text().lines() {
            writeln!(f, "    {}", line)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::Decision;

    #[test]
    fn test_bug_report_display_names_kind_and_trace() {
        let mut trace = Trace::new();
        trace.push(Decision::Schedule(EntityId(1)));
        trace.push(Decision::Bool(true));

        let report = BugReport::new(BugKind::Safety, "counter exceeded bound", trace)
            .with_entity(EntityId(1));
        let text = format!("{}", report);

        assert!(text.contains("safety violation: counter exceeded bound"));
        assert!(text.contains("(entity 1)"));
        assert!(text.contains("found after 2 decision(s)"));
        assert!(text.contains("sch 1"));
        assert!(text.contains("bool true"));
    }

    #[test]
    fn test_error_display() {
        let err = InterleaveError::TraceParse {
            line: 3,
            content: "garbage".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "failed to parse trace at line 3: 'garbage'"
        );
    }
}
