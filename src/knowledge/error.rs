//! Knowledge store error types.

use std::path::PathBuf;

/// Errors from an embedding provider.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EmbeddingError {
    #[error("API key not configured (env: {0})")]
    MissingApiKey(String),
    #[error("Embedding request failed: {0}")]
    RequestFailed(String),
    #[error("Failed to parse embedding response: {0}")]
    ParseError(String),
    #[error("Embedding request timed out")]
    Timeout,
}

/// Errors from the knowledge index, snapshotting, or watching.
#[derive(thiserror::Error, Debug)]
pub enum KnowledgeError {
    /// Failed to open or create the index database.
    #[error("Failed to open index at {path}: {source}")]
    DatabaseOpen {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// Failed to execute SQL.
    #[error("Index query failed: {0}")]
    Query(#[from] rusqlite::Error),

    /// Failed to encode or decode a stored embedding.
    #[error("Embedding serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Blocking task was cancelled.
    #[error("Blocking task cancelled")]
    TaskCancelled,

    /// Failed to create the index directory.
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to read the source tree.
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The source directory does not exist.
    #[error("Source directory not found: {0}")]
    SourceNotFound(PathBuf),

    /// File system watcher error.
    #[error("Watcher error: {0}")]
    Watch(#[from] notify::Error),

    /// The embedding provider failed.
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_api_key_display() {
        let err = EmbeddingError::MissingApiKey("GEMINI_API_KEY".to_string());
        assert_eq!(err.to_string(), "API key not configured (env: GEMINI_API_KEY)");
    }

    #[test]
    fn test_source_not_found_display() {
        let err = KnowledgeError::SourceNotFound(PathBuf::from("/kb"));
        assert_eq!(err.to_string(), "Source directory not found: /kb");
    }

    #[test]
    fn test_embedding_error_is_transparent() {
        let err = KnowledgeError::from(EmbeddingError::Timeout);
        assert_eq!(err.to_string(), "Embedding request timed out");
    }
}
