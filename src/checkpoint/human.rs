//! Suspend/resume transitions.

use serde::{Deserialize, Serialize};

use crate::context::handover_key;
use crate::scheduler::{RunStatus, WorkflowRun};

use super::error::CheckpointError;

/// Data supplied by a human to resume a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanInput {
    /// The option the human picked.
    pub selection: String,
    /// Free-text feedback for the following phases.
    #[serde(default)]
    pub feedback: Option<String>,
}

impl HumanInput {
    pub fn new(selection: impl Into<String>, feedback: Option<String>) -> Self {
        Self {
            selection: selection.into(),
            feedback,
        }
    }
}

/// Acknowledgement returned by a successful resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointAck {
    pub run_id: String,
    /// Phase whose checkpoint was resumed.
    pub phase_id: String,
    /// Context key holding the payload.
    pub handover_key: String,
}

/// Move `run` to `awaiting_input` at its current phase.
///
/// # Errors
///
/// Returns [`CheckpointError::NoCheckpoint`] if the current phase does not
/// declare a checkpoint.
pub fn suspend(run: &mut WorkflowRun) -> Result<(), CheckpointError> {
    let phase_id = match run.current_phase() {
        Some(phase) if phase.checkpoint => phase.id.clone(),
        other => {
            return Err(CheckpointError::NoCheckpoint {
                phase_id: other.map(|p| p.id.clone()).unwrap_or_default(),
            })
        }
    };
    tracing::info!(run_id = %run.id, phase = %phase_id, "Run awaiting human input");
    run.status = RunStatus::AwaitingInput;
    Ok(())
}

/// Store `input` under the phase's handover key and advance to the next phase.
///
/// # Errors
///
/// Returns [`CheckpointError::NotAwaitingInput`] unless the run is suspended.
pub fn resume(run: &mut WorkflowRun, input: &HumanInput) -> Result<CheckpointAck, CheckpointError> {
    if run.status != RunStatus::AwaitingInput {
        return Err(CheckpointError::NotAwaitingInput {
            run_id: run.id.clone(),
            status: run.status,
        });
    }
    let phase_id = run
        .current_phase()
        .map(|p| p.id.clone())
        .ok_or_else(|| CheckpointError::NoCheckpoint {
            phase_id: String::new(),
        })?;

    let key = handover_key(&phase_id);
    let payload = serde_json::json!({
        "selection": input.selection,
        "feedback": input.feedback,
    });
    run.context.write(key.clone(), 1, payload)?;
    run.current_phase += 1;
    run.status = RunStatus::Running;
    tracing::info!(run_id = %run.id, phase = %phase_id, "Run resumed");

    Ok(CheckpointAck {
        run_id: run.id.clone(),
        phase_id,
        handover_key: key,
    })
}
