//! Gate boundary and built-in gates.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Results of a phase, handed to its gate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutputs {
    pub run_id: String,
    pub phase_id: String,
    /// Outputs of completed top-level tasks.
    pub outputs: BTreeMap<String, Value>,
    /// Top-level tasks that failed.
    pub failed: Vec<String>,
    /// Top-level tasks skipped because a dependency failed.
    pub skipped: Vec<String>,
    /// Revisions already applied to this phase.
    pub revisions: u32,
}

impl PhaseOutputs {
    /// Whether every top-level task completed.
    #[must_use]
    pub fn all_completed(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Decision taken at a phase boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateDecision {
    /// Advance to the checkpoint or next phase.
    Approve,
    /// Re-run the listed tasks and everything depending on them.
    Revise(Vec<String>),
    /// End the run as `rejected`.
    Reject(String),
}

impl GateDecision {
    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Revise(_) => "revise",
            Self::Reject(_) => "reject",
        }
    }
}

/// Evaluates phase results.
///
/// Which tasks to revise on a partial failure is up to the implementation.
#[async_trait]
pub trait QualityGate: Send + Sync {
    async fn evaluate(&self, phase: &PhaseOutputs) -> GateDecision;
}

/// Approves every phase.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApproveGate;

#[async_trait]
impl QualityGate for ApproveGate {
    async fn evaluate(&self, _phase: &PhaseOutputs) -> GateDecision {
        GateDecision::Approve
    }
}

/// Rejects phases with failed tasks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFailuresGate;

#[async_trait]
impl QualityGate for NoFailuresGate {
    async fn evaluate(&self, phase: &PhaseOutputs) -> GateDecision {
        if phase.failed.is_empty() {
            GateDecision::Approve
        } else {
            GateDecision::Reject(format!(
                "Phase '{}' has failed tasks: {}",
                phase.phase_id,
                phase.failed.join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_failures_gate() {
        let mut phase = PhaseOutputs {
            phase_id: "draft".to_string(),
            ..PhaseOutputs::default()
        };
        assert_eq!(NoFailuresGate.evaluate(&phase).await, GateDecision::Approve);

        phase.failed = vec!["copy".to_string(), "art".to_string()];
        assert_eq!(
            NoFailuresGate.evaluate(&phase).await,
            GateDecision::Reject("Phase 'draft' has failed tasks: copy, art".to_string())
        );
    }

    #[tokio::test]
    async fn test_approve_gate_ignores_failures() {
        let phase = PhaseOutputs {
            failed: vec!["x".to_string()],
            ..PhaseOutputs::default()
        };
        assert!(!phase.all_completed());
        assert_eq!(ApproveGate.evaluate(&phase).await, GateDecision::Approve);
    }
}
