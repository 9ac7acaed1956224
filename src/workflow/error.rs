//! Workflow validation errors.

use std::path::PathBuf;

/// Errors that reject a workflow specification at submission.
///
/// All variants are fatal: no run is created.
#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    /// Failed to read the specification file.
    #[error("Failed to read workflow spec {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse the specification document.
    #[error("Failed to parse workflow spec: {0}")]
    Parse(#[from] toml::de::Error),

    /// The workflow declares no phases.
    #[error("Workflow '{0}' declares no phases")]
    EmptyWorkflow(String),

    /// A phase declares no tasks.
    #[error("Phase '{0}' declares no tasks")]
    EmptyPhase(String),

    /// Two phases share an id.
    #[error("Duplicate phase id: {0}")]
    DuplicatePhase(String),

    /// Two tasks share an id.
    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    /// A task id uses reserved syntax.
    #[error("Invalid task id '{0}': ids must be non-empty and must not contain '/' or ':'")]
    InvalidTaskId(String),

    /// A parallel phase allows zero concurrent tasks.
    #[error("Phase '{0}' has a parallel limit of zero")]
    InvalidConcurrency(String),

    /// A dependency names a task that does not exist.
    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    /// A dependency names a task of a later phase.
    #[error("Task '{task}' depends on '{dependency}' from a later phase")]
    ForwardDependency { task: String, dependency: String },

    /// An input key names a task that does not exist.
    #[error("Task '{task}' reads unknown context key '{key}'")]
    UnknownInput { task: String, key: String },

    /// An input key names a task that is not guaranteed to finish first.
    #[error("Task '{task}' reads '{key}' without depending on it or running in a later phase")]
    UnorderedInput { task: String, key: String },

    /// A handover key names an unknown phase.
    #[error("Task '{task}' reads handover from unknown phase '{phase}'")]
    UnknownHandover { task: String, phase: String },

    /// A handover key names a phase without a human checkpoint.
    #[error("Task '{task}' reads handover from phase '{phase}' which has no checkpoint")]
    HandoverWithoutCheckpoint { task: String, phase: String },

    /// A handover key names the reading task's own or a later phase.
    #[error("Task '{task}' reads handover from phase '{phase}' which does not precede it")]
    HandoverNotEarlier { task: String, phase: String },

    /// A retrieval request asks for zero results.
    #[error("Task '{0}' requests retrieval with k = 0")]
    InvalidRetrieval(String),

    /// The dependency relation contains a cycle.
    #[error("Dependency cycle: {}", tasks.join(" -> "))]
    DependencyCycle { tasks: Vec<String> },

    /// A task is bound to a role with no registered worker.
    #[error("Task '{task}' uses unregistered role '{role}'")]
    UnknownRole { task: String, role: String },

    /// A phase references an unregistered quality gate.
    #[error("Phase '{phase}' uses unregistered gate '{gate}'")]
    UnknownGate { phase: String, gate: String },
}
