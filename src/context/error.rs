//! Context store error types.

/// Errors raised by the context store.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// The key already holds a value written by the same (or a newer) attempt.
    #[error("Duplicate context write for '{key}' (attempt {attempt})")]
    DuplicateWrite { key: String, attempt: u32 },

    /// A referenced key was absent when the reading task was dispatched.
    #[error("Missing context key '{key}'")]
    MissingContext { key: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_write_display() {
        let err = ContextError::DuplicateWrite {
            key: "brief".to_string(),
            attempt: 2,
        };
        assert_eq!(
            err.to_string(),
            "Duplicate context write for 'brief' (attempt 2)"
        );
    }

    #[test]
    fn test_missing_context_display() {
        let err = ContextError::MissingContext {
            key: "handover:analysis".to_string(),
        };
        assert_eq!(err.to_string(), "Missing context key 'handover:analysis'");
    }
}
