//! Scheduler and worker error types.

use crate::checkpoint::CheckpointError;
use crate::runlog::RunLogError;

use super::run::RunStatus;

/// Error returned by a worker.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Recoverable; the task is retried with backoff.
    #[error("Transient worker error: {0}")]
    Transient(String),

    /// Not recoverable; the task fails immediately.
    #[error("Fatal worker error: {0}")]
    Fatal(String),
}

impl WorkerError {
    /// Whether the scheduler should retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Infrastructure failures while driving a run.
///
/// Task failures and gate rejections are recorded on the run instead.
#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    /// The run log could not be written or read.
    #[error("Run log error: {0}")]
    RunLog(#[from] RunLogError),

    /// A phase could not be suspended at its checkpoint.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// The run is already finished.
    #[error("Run {run_id} is {status} and cannot be executed")]
    RunFinished { run_id: String, status: RunStatus },
}
