//! Worker boundary and the per-run worker registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::delegation::DelegatedTask;

use super::error::WorkerError;

/// Input key under which retrieval results are passed to a worker.
pub const RETRIEVAL_INPUT: &str = "retrieval";

/// Everything a worker receives for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub run_id: String,
    pub task_id: String,
    pub role: String,
    /// Resolved input context, keyed by context key.
    pub inputs: BTreeMap<String, Value>,
    pub depth: u32,
    /// 1-based attempt within the current revision.
    pub attempt: u32,
    pub revision: u32,
}

impl TaskRequest {
    /// Retrieval results, if the task declared a query.
    #[must_use]
    pub fn retrieval(&self) -> Option<&Value> {
        self.inputs.get(RETRIEVAL_INPUT)
    }
}

/// Computes task outputs for one role.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Produce the output of a specialist task.
    ///
    /// # Errors
    ///
    /// [`WorkerError::Transient`] failures are retried; [`WorkerError::Fatal`]
    /// fails the task.
    async fn execute(&self, request: &TaskRequest) -> Result<Value, WorkerError>;

    /// Produce the children of a manager task.
    ///
    /// # Errors
    ///
    /// Same retry semantics as [`Worker::execute`].
    async fn delegate(&self, request: &TaskRequest) -> Result<Vec<DelegatedTask>, WorkerError> {
        let _ = request;
        Ok(Vec::new())
    }
}

/// Role name to worker mapping, built per scheduler and passed explicitly.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `worker` for `role`, replacing any previous one.
    #[must_use]
    pub fn with(mut self, role: impl Into<String>, worker: impl Worker + 'static) -> Self {
        self.register(role, Arc::new(worker));
        self
    }

    /// Register a shared worker for `role`.
    pub fn register(&mut self, role: impl Into<String>, worker: Arc<dyn Worker>) {
        self.workers.insert(role.into(), worker);
    }

    /// Worker for `role`.
    #[must_use]
    pub fn get(&self, role: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(role).cloned()
    }

    /// Whether `role` has a worker.
    #[must_use]
    pub fn contains(&self, role: &str) -> bool {
        self.workers.contains_key(role)
    }

    /// Registered roles in sorted order.
    #[must_use]
    pub fn roles(&self) -> Vec<&str> {
        let mut roles: Vec<&str> = self.workers.keys().map(String::as_str).collect();
        roles.sort_unstable();
        roles
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("roles", &self.roles())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Worker for Echo {
        async fn execute(&self, request: &TaskRequest) -> Result<Value, WorkerError> {
            Ok(json!(request.task_id))
        }
    }

    fn request() -> TaskRequest {
        TaskRequest {
            run_id: "r".to_string(),
            task_id: "t".to_string(),
            role: "echo".to_string(),
            inputs: BTreeMap::new(),
            depth: 0,
            attempt: 1,
            revision: 1,
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = WorkerRegistry::new().with("echo", Echo);
        assert!(registry.contains("echo"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.roles(), vec!["echo"]);
    }

    #[tokio::test]
    async fn test_default_delegate_returns_no_children() {
        let children = Echo.delegate(&request()).await.unwrap();
        assert!(children.is_empty());
        assert_eq!(Echo.execute(&request()).await.unwrap(), json!("t"));
    }
}
