//! Run state: tasks, phases, statuses and history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::ContextStore;
use crate::delegation::TaskKind;
use crate::workflow::{ConcurrencyPolicy, RetrievalRequest, ValidatedSpec};

/// Lifecycle of a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Whether the task will not change again without a revise.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initialized,
    Running,
    AwaitingGate,
    AwaitingInput,
    Rejected,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::AwaitingGate => "awaiting_gate",
            Self::AwaitingInput => "awaiting_input",
            Self::Rejected => "rejected",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse from the string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "initialized" => Self::Initialized,
            "running" => Self::Running,
            "awaiting_gate" => Self::AwaitingGate,
            "awaiting_input" => Self::AwaitingInput,
            "rejected" => Self::Rejected,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    /// Whether the run has finished for good.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Completed | Self::Failed | Self::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task failed or was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The worker reported a non-recoverable error.
    Worker,
    /// Transient errors persisted through every attempt.
    RetriesExhausted,
    /// A declared input key was absent at dispatch.
    MissingContext,
    /// Delegation or aggregation failed.
    Delegation,
    /// The output could not be written to context.
    Context,
    /// A dependency failed, so the task never ran.
    DependencyFailed,
}

impl FailureKind {
    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Worker => "worker",
            Self::RetriesExhausted => "retries_exhausted",
            Self::MissingContext => "missing_context",
            Self::Delegation => "delegation",
            Self::Context => "context",
            Self::DependencyFailed => "dependency_failed",
        }
    }
}

/// Failure record kept on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Task whose failure caused this one, if any.
    pub caused_by: Option<String>,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            caused_by: None,
        }
    }

    #[must_use]
    pub fn caused_by(mut self, task_id: impl Into<String>) -> Self {
        self.caused_by = Some(task_id.into());
        self
    }
}

/// Why a run ended unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub phase_id: String,
    pub reason: String,
    /// Failed task ids, from the first failed task to its root cause.
    pub causal_chain: Vec<String>,
}

/// A task in a run.
///
/// Identity fields are fixed at creation; only the scheduler mutates the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    pub phase_id: String,
    pub phase_index: usize,
    pub role: String,
    pub kind: TaskKind,
    /// Full ids of the tasks this one waits for.
    pub depends_on: Vec<String>,
    /// Context keys resolved into the worker request.
    pub inputs: Vec<String>,
    pub retrieval: Option<RetrievalRequest>,
    pub depth: u32,
    /// Position among all tasks of the run; ready ties are broken on it.
    pub ordinal: usize,
    /// Manager that delegated this task.
    pub parent: Option<String>,
    /// Delegated children, in delegation order.
    pub children: Vec<String>,
    pub status: TaskStatus,
    /// Context attempt; bumped whenever the task is revised.
    pub revision: u32,
    /// Worker attempts within the current revision.
    pub attempts: u32,
    pub failure: Option<TaskFailure>,
}

impl TaskNode {
    /// Reset to `pending` for a new revision.
    pub fn reset(&mut self) {
        self.status = TaskStatus::Pending;
        self.revision += 1;
        self.attempts = 0;
        self.failure = None;
        self.children.clear();
    }
}

/// A phase of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    /// Top-level task ids in declaration order.
    pub task_ids: Vec<String>,
    pub concurrency: ConcurrencyPolicy,
    pub gate: String,
    pub checkpoint: bool,
    /// Gate revisions applied so far.
    pub revisions: u32,
}

/// Kind of history event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Dispatched,
    Completed,
    Retrying,
    Failed,
    Skipped,
    Delegated,
    Revised,
    GateApproved,
    GateRevised,
    GateRejected,
    Suspended,
    Resumed,
}

impl Outcome {
    /// Returns the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::Completed => "completed",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Delegated => "delegated",
            Self::Revised => "revised",
            Self::GateApproved => "gate_approved",
            Self::GateRevised => "gate_revised",
            Self::GateRejected => "gate_rejected",
            Self::Suspended => "suspended",
            Self::Resumed => "resumed",
        }
    }

    /// Parse from the string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "dispatched" => Self::Dispatched,
            "completed" => Self::Completed,
            "retrying" => Self::Retrying,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            "delegated" => Self::Delegated,
            "revised" => Self::Revised,
            "gate_approved" => Self::GateApproved,
            "gate_revised" => Self::GateRevised,
            "gate_rejected" => Self::GateRejected,
            "suspended" => Self::Suspended,
            "resumed" => Self::Resumed,
            _ => return None,
        })
    }
}

/// One line of a run's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Strictly increasing within a run.
    pub seq: u64,
    /// Task id, or phase id for gate and checkpoint events.
    pub task_id: String,
    pub outcome: Outcome,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub workflow: String,
    pub phases: Vec<Phase>,
    /// All tasks, top-level first in declaration order, then delegated children.
    pub tasks: Vec<TaskNode>,
    pub context: ContextStore,
    pub history: Vec<HistoryEntry>,
    pub current_phase: usize,
    pub status: RunStatus,
    pub failure: Option<RunFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    next_seq: u64,
    next_ordinal: usize,
}

impl WorkflowRun {
    /// Build a fresh run from a validated specification.
    #[must_use]
    pub fn new(spec: &ValidatedSpec) -> Self {
        let mut phases = Vec::new();
        let mut tasks = Vec::new();

        for (phase_index, phase) in spec.spec().phases.iter().enumerate() {
            phases.push(Phase {
                id: phase.id.clone(),
                task_ids: phase.tasks.iter().map(|t| t.id.clone()).collect(),
                concurrency: phase.concurrency,
                gate: phase.gate.clone(),
                checkpoint: phase.checkpoint,
                revisions: 0,
            });
            for task in &phase.tasks {
                tasks.push(TaskNode {
                    id: task.id.clone(),
                    phase_id: phase.id.clone(),
                    phase_index,
                    role: task.role.clone(),
                    kind: task.kind,
                    depends_on: task.depends_on.clone(),
                    inputs: task.inputs.clone(),
                    retrieval: task.retrieval.clone(),
                    depth: 0,
                    ordinal: tasks.len(),
                    parent: None,
                    children: Vec::new(),
                    status: TaskStatus::Pending,
                    revision: 1,
                    attempts: 0,
                    failure: None,
                });
            }
        }

        let now = Utc::now();
        let next_ordinal = tasks.len();
        Self {
            id: Uuid::new_v4().to_string(),
            workflow: spec.name().to_string(),
            phases,
            tasks,
            context: ContextStore::new(),
            history: Vec::new(),
            current_phase: 0,
            status: RunStatus::Initialized,
            failure: None,
            created_at: now,
            updated_at: now,
            next_seq: 1,
            next_ordinal,
        }
    }

    /// Look up a task by id.
    #[must_use]
    pub fn task(&self, id: &str) -> Option<&TaskNode> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Look up a task by id for mutation.
    pub fn task_mut(&mut self, id: &str) -> Option<&mut TaskNode> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Status of a task, if it exists.
    #[must_use]
    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.task(id).map(|t| t.status)
    }

    /// The phase the run is currently in, if any remain.
    #[must_use]
    pub fn current_phase(&self) -> Option<&Phase> {
        self.phases.get(self.current_phase)
    }

    /// Append a history entry and return a copy of it.
    pub fn record(
        &mut self,
        task_id: impl Into<String>,
        outcome: Outcome,
        detail: Option<String>,
    ) -> HistoryEntry {
        let entry = HistoryEntry {
            seq: self.next_seq,
            task_id: task_id.into(),
            outcome,
            detail,
            timestamp: Utc::now(),
        };
        self.next_seq += 1;
        self.updated_at = entry.timestamp;
        self.history.push(entry.clone());
        entry
    }

    /// History entries for one task, oldest first.
    pub fn history_of<'a>(&'a self, task_id: &'a str) -> impl Iterator<Item = &'a HistoryEntry> {
        self.history.iter().filter(move |e| e.task_id == task_id)
    }

    /// First history entry for `task_id` with `outcome`.
    #[must_use]
    pub fn first_event<'a>(
        &'a self,
        task_id: &'a str,
        outcome: Outcome,
    ) -> Option<&'a HistoryEntry> {
        self.history_of(task_id).find(|e| e.outcome == outcome)
    }

    /// Last history entry for `task_id` with `outcome`.
    #[must_use]
    pub fn last_event<'a>(
        &'a self,
        task_id: &'a str,
        outcome: Outcome,
    ) -> Option<&'a HistoryEntry> {
        self.history_of(task_id).filter(|e| e.outcome == outcome).last()
    }

    /// Replace the history with the persisted log when the log is ahead.
    ///
    /// A snapshot may lag behind entries appended after it was saved. Returns
    /// true if the history was replaced.
    pub fn adopt_history(&mut self, persisted: Vec<HistoryEntry>) -> bool {
        let Some(last) = persisted.last().map(|e| e.seq) else {
            return false;
        };
        if last < self.next_seq {
            return false;
        }
        self.next_seq = last + 1;
        self.history = persisted;
        true
    }

    pub(crate) fn next_ordinal(&mut self) -> usize {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;
        ordinal
    }

    /// Failed task ids starting at `task_id`, following `caused_by` links.
    #[must_use]
    pub fn causal_chain(&self, task_id: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = Some(task_id.to_string());
        while let Some(id) = current {
            if chain.contains(&id) {
                break;
            }
            current = self
                .task(&id)
                .and_then(|t| t.failure.as_ref())
                .and_then(|f| f.caused_by.clone());
            chain.push(id);
        }
        chain
    }

    /// Top-level tasks of a phase in declaration order.
    pub fn phase_tasks(&self, phase_index: usize) -> impl Iterator<Item = &TaskNode> {
        self.tasks
            .iter()
            .filter(move |t| t.phase_index == phase_index && t.parent.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{PhaseSpec, TaskSpec, WorkflowSpec};

    fn run() -> WorkflowRun {
        let spec = WorkflowSpec::new("demo")
            .phase(
                PhaseSpec::new("p1")
                    .task(TaskSpec::new("a", "writer"))
                    .task(TaskSpec::new("b", "writer").depends_on(["a"])),
            )
            .phase(PhaseSpec::new("p2").task(TaskSpec::new("c", "writer").depends_on(["b"])));
        WorkflowRun::new(&ValidatedSpec::new(spec).unwrap())
    }

    #[test]
    fn test_new_run_layout() {
        let run = run();
        assert_eq!(run.status, RunStatus::Initialized);
        assert_eq!(run.phases.len(), 2);
        assert_eq!(run.phases[0].task_ids, vec!["a", "b"]);
        let c = run.task("c").unwrap();
        assert_eq!(c.phase_index, 1);
        assert_eq!(c.ordinal, 2);
        assert_eq!(c.revision, 1);
        assert_eq!(c.status, TaskStatus::Pending);
        assert!(Uuid::parse_str(&run.id).is_ok());
    }

    #[test]
    fn test_record_assigns_increasing_seq() {
        let mut run = run();
        let first = run.record("a", Outcome::Dispatched, None);
        let second = run.record("a", Outcome::Completed, None);
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(run.history.len(), 2);
        assert_eq!(run.last_event("a", Outcome::Completed).unwrap().seq, 2);
    }

    #[test]
    fn test_event_lookup_with_owned_id() {
        let mut run = run();
        run.record("a", Outcome::Dispatched, None);
        run.record("a", Outcome::Retrying, None);
        run.record("a", Outcome::Dispatched, None);

        let id = String::from("a");
        let first = run.first_event(&id, Outcome::Dispatched).map(|e| e.seq);
        let last = run.last_event(&id, Outcome::Dispatched).map(|e| e.seq);
        assert_eq!((first, last), (Some(1), Some(3)));
        assert!(run.first_event("b", Outcome::Dispatched).is_none());
    }

    #[test]
    fn test_adopt_history_reseeds_seq() {
        let mut stale = run();
        stale.record("a", Outcome::Dispatched, None);
        let mut live = stale.clone();
        live.record("a", Outcome::Completed, None);
        live.record("b", Outcome::Dispatched, None);

        assert!(stale.adopt_history(live.history.clone()));
        assert_eq!(stale.history, live.history);
        assert_eq!(stale.record("b", Outcome::Completed, None).seq, 4);

        // A log that is not ahead leaves the run alone
        let behind = stale.history[..1].to_vec();
        assert!(!stale.adopt_history(behind));
        assert!(!stale.adopt_history(Vec::new()));
        assert_eq!(stale.history.len(), 4);
    }

    #[test]
    fn test_causal_chain_follows_caused_by() {
        let mut run = run();
        run.task_mut("a").unwrap().failure = Some(TaskFailure::new(FailureKind::Worker, "boom"));
        run.task_mut("b").unwrap().failure =
            Some(TaskFailure::new(FailureKind::Delegation, "child failed").caused_by("a"));
        assert_eq!(run.causal_chain("b"), vec!["b", "a"]);
    }

    #[test]
    fn test_outcome_string_round_trip() {
        assert_eq!(Outcome::parse(Outcome::GateRevised.as_str()), Some(Outcome::GateRevised));
        assert_eq!(Outcome::parse("nope"), None);
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::AwaitingInput.is_terminal());
    }
}
