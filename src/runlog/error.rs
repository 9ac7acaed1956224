//! Run log error types.

use std::path::PathBuf;

/// Errors that can occur during run log operations.
#[derive(thiserror::Error, Debug)]
pub enum RunLogError {
    /// Failed to open or create database.
    #[error("Failed to open database at {path}: {source}")]
    DatabaseOpen {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Failed to execute SQL.
    #[error("Database query failed: {0}")]
    Query(#[from] rusqlite::Error),

    /// Failed to (de)serialize a snapshot.
    #[error("Snapshot serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A stored value could not be decoded.
    #[error("Corrupt run log row: {0}")]
    Corrupt(String),

    /// Blocking task was cancelled.
    #[error("Blocking task cancelled")]
    TaskCancelled,

    /// Failed to create parent directory.
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_open_display() {
        let err = RunLogError::DatabaseOpen {
            path: PathBuf::from("/tmp/runs.db"),
            source: rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(1),
                Some("test".to_string()),
            ),
        };
        assert!(err.to_string().contains("Failed to open database"));
        assert!(err.to_string().contains("/tmp/runs.db"));
    }

    #[test]
    fn test_corrupt_display() {
        let err = RunLogError::Corrupt("unknown outcome 'x'".to_string());
        assert_eq!(err.to_string(), "Corrupt run log row: unknown outcome 'x'");
    }
}
