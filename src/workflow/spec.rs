//! Workflow specification types.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::delegation::TaskKind;

use super::error::ValidationError;

/// Name of the gate used when a phase does not declare one.
pub const DEFAULT_GATE: &str = "approve";

/// How many tasks of a phase may run at the same time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// One task at a time.
    #[default]
    Sequential,
    /// Up to N tasks at a time.
    Parallel(usize),
}

impl ConcurrencyPolicy {
    /// Worker pool size for the phase.
    #[must_use]
    pub fn limit(&self) -> usize {
        match self {
            Self::Sequential => 1,
            Self::Parallel(n) => *n,
        }
    }
}

/// A knowledge-store query issued when a task is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalRequest {
    /// Query text to embed.
    pub query: String,
    /// Number of documents to return; falls back to the configured default.
    #[serde(default)]
    pub k: Option<usize>,
}

/// A task declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique task id.
    pub id: String,
    /// Worker role the task is bound to.
    pub role: String,
    /// Tasks that must complete before this one is dispatched.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Context keys passed to the worker.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Specialist or manager.
    #[serde(default)]
    pub kind: TaskKind,
    /// Optional knowledge-store query.
    #[serde(default)]
    pub retrieval: Option<RetrievalRequest>,
}

impl TaskSpec {
    /// Create a specialist task with no dependencies.
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            depends_on: Vec::new(),
            inputs: Vec::new(),
            kind: TaskKind::Specialist,
            retrieval: None,
        }
    }

    /// Add dependencies.
    #[must_use]
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Add input context keys.
    #[must_use]
    pub fn inputs<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Set the task kind.
    #[must_use]
    pub fn kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    /// Attach a retrieval request.
    #[must_use]
    pub fn retrieval(mut self, query: impl Into<String>, k: Option<usize>) -> Self {
        self.retrieval = Some(RetrievalRequest {
            query: query.into(),
            k,
        });
        self
    }
}

fn default_gate() -> String {
    DEFAULT_GATE.to_string()
}

/// A phase declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    /// Unique phase id.
    pub id: String,
    /// Tasks in definition order.
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    /// Quality gate evaluated when the phase finishes.
    #[serde(default = "default_gate")]
    pub gate: String,
    /// Suspend for human input after gate approval.
    #[serde(default)]
    pub checkpoint: bool,
    /// Concurrency policy.
    #[serde(default)]
    pub concurrency: ConcurrencyPolicy,
}

impl PhaseSpec {
    /// Create a sequential phase using the default gate.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tasks: Vec::new(),
            gate: default_gate(),
            checkpoint: false,
            concurrency: ConcurrencyPolicy::Sequential,
        }
    }

    /// Append a task.
    #[must_use]
    pub fn task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    /// Set the gate name.
    #[must_use]
    pub fn gate(mut self, gate: impl Into<String>) -> Self {
        self.gate = gate.into();
        self
    }

    /// Enable the human checkpoint.
    #[must_use]
    pub fn with_checkpoint(mut self) -> Self {
        self.checkpoint = true;
        self
    }

    /// Set the concurrency policy.
    #[must_use]
    pub fn concurrency(mut self, concurrency: ConcurrencyPolicy) -> Self {
        self.concurrency = concurrency;
        self
    }
}

/// A complete workflow declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    /// Workflow name.
    pub name: String,
    /// Phases in execution order.
    #[serde(default)]
    pub phases: Vec<PhaseSpec>,
}

impl WorkflowSpec {
    /// Create an empty workflow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phases: Vec::new(),
        }
    }

    /// Append a phase.
    #[must_use]
    pub fn phase(mut self, phase: PhaseSpec) -> Self {
        self.phases.push(phase);
        self
    }

    /// Parse a workflow from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Parse`] if the document is malformed.
    pub fn from_toml_str(content: &str) -> Result<Self, ValidationError> {
        Ok(toml::from_str(content)?)
    }

    /// Load a workflow from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ValidationError> {
        let content = std::fs::read_to_string(path).map_err(|source| ValidationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Iterate over all tasks with their phase index, in definition order.
    pub fn tasks(&self) -> impl Iterator<Item = (usize, &TaskSpec)> {
        self.phases
            .iter()
            .enumerate()
            .flat_map(|(idx, phase)| phase.tasks.iter().map(move |task| (idx, task)))
    }
}
