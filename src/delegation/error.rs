//! Delegation error types.

/// Errors that fail a manager task.
///
/// Delegation errors are fatal to the manager only; unrelated tasks keep
/// running.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DelegationError {
    /// Children would run deeper than the configured maximum.
    #[error("Delegation depth {depth} exceeds maximum {max}")]
    DepthExceeded { depth: u32, max: u32 },

    /// Two children share a name.
    #[error("Duplicate child task name: {0}")]
    DuplicateChild(String),

    /// A child name uses reserved syntax.
    #[error("Invalid child task name '{0}'")]
    InvalidChildName(String),

    /// A child depends on a sibling that was not delegated.
    #[error("Child '{child}' depends on unknown sibling '{dependency}'")]
    UnknownSibling { child: String, dependency: String },

    /// Sibling dependencies form a cycle.
    #[error("Child dependencies form a cycle")]
    ChildCycle,

    /// A required child failed (`merge` and `concat`).
    #[error("Child task '{child}' failed")]
    ChildFailed { child: String },

    /// No child succeeded (`select-best`).
    #[error("No child task succeeded")]
    NoSuccessfulChild,

    /// `select-best` was requested but no evaluator is registered.
    #[error("No evaluator registered for select-best aggregation")]
    NoEvaluator,

    /// The evaluator picked an index outside the candidate list.
    #[error("Evaluator selected candidate {index} of {candidates}")]
    InvalidSelection { index: usize, candidates: usize },

    /// The evaluator itself failed.
    #[error("Evaluator failed: {0}")]
    Evaluator(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_exceeded_display() {
        let err = DelegationError::DepthExceeded { depth: 3, max: 2 };
        assert_eq!(err.to_string(), "Delegation depth 3 exceeds maximum 2");
    }

    #[test]
    fn test_child_failed_display() {
        let err = DelegationError::ChildFailed {
            child: "mgr/copy".to_string(),
        };
        assert_eq!(err.to_string(), "Child task 'mgr/copy' failed");
    }
}
