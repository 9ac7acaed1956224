//! Checkpoint error types.

use crate::context::ContextError;
use crate::runlog::RunLogError;
use crate::scheduler::RunStatus;

/// Errors from suspending or resuming a run.
#[derive(thiserror::Error, Debug)]
pub enum CheckpointError {
    /// Resume was called on a run that is not suspended.
    #[error("Run {run_id} is {status}, not awaiting input")]
    NotAwaitingInput { run_id: String, status: RunStatus },

    /// Suspend was called for a phase without a checkpoint.
    #[error("Phase '{phase_id}' has no human checkpoint")]
    NoCheckpoint { phase_id: String },

    /// No persisted run has this id.
    #[error("Run not found: {0}")]
    RunNotFound(String),

    /// Resuming through the scheduler needs an attached run log.
    #[error("No run log attached")]
    NoRunLog,

    /// The handover payload could not be written.
    #[error("Failed to store handover: {0}")]
    Context(#[from] ContextError),

    /// Loading or saving the run failed.
    #[error("Run log error: {0}")]
    RunLog(#[from] RunLogError),
}
