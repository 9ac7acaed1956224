//! Phase-by-phase execution of a workflow run.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;

use crate::checkpoint::{self, CheckpointAck, CheckpointError, HumanInput};
use crate::config::{DelegationConfig, SchedulerConfig};
use crate::context::retrieval_key;
use crate::delegation::{
    aggregate, child_depth, child_task_id, validate_children, AggregationStrategy, ChildOutcome,
    DelegatedTask, DelegationError, Evaluator, FirstSuccess,
};
use crate::gate::{GateDecision, GateRegistry, PhaseOutputs};
use crate::knowledge::{KnowledgeStore, RetrievalResult};
use crate::runlog::{RunLog, RunLogError};
use crate::workflow::{ValidatedSpec, ValidationError, WorkflowSpec};

use super::error::{SchedulerError, WorkerError};
use super::run::{
    FailureKind, HistoryEntry, Outcome, RunFailure, RunStatus, TaskFailure, TaskNode, TaskStatus,
    WorkflowRun,
};
use super::worker::{TaskRequest, WorkerRegistry, RETRIEVAL_INPUT};

/// Default number of retrieval hits when a task does not set `k`.
const DEFAULT_RETRIEVAL_K: usize = 5;

/// Signals delivered to the phase loop.
enum Completion {
    /// A specialist worker call returned.
    Executed {
        task_id: String,
        retrieval: Option<Value>,
        result: Result<Value, WorkerError>,
    },
    /// A manager's `delegate` call returned.
    Delegated {
        task_id: String,
        retrieval: Option<Value>,
        result: Result<Vec<DelegatedTask>, WorkerError>,
    },
    /// A manager's children were aggregated.
    Aggregated {
        task_id: String,
        result: Result<Value, DelegationError>,
    },
    /// A retry delay ran out.
    BackoffElapsed { task_id: String },
}

/// Retrieval to perform before calling the worker.
enum RetrievalPlan {
    None,
    Cached(Value),
    Query { query: String, k: usize },
}

enum PhaseEnd {
    Settled,
    Cancelled,
}

/// Per-phase bookkeeping of the dispatch loop.
struct PhaseLoop {
    join: JoinSet<Completion>,
    /// Worker calls holding a pool slot.
    in_flight: usize,
    backing_off: HashSet<String>,
    aggregating: HashSet<String>,
}

impl PhaseLoop {
    fn new() -> Self {
        Self {
            join: JoinSet::new(),
            in_flight: 0,
            backing_off: HashSet::new(),
            aggregating: HashSet::new(),
        }
    }
}

/// Drives workflow runs.
///
/// Workers and gates come from explicit registries; nothing is looked up
/// globally. Runs are plain values owned by the caller, so one scheduler can
/// drive many runs.
pub struct Scheduler {
    workers: WorkerRegistry,
    gates: GateRegistry,
    evaluator: Arc<dyn Evaluator>,
    knowledge: Option<Arc<KnowledgeStore>>,
    default_k: usize,
    runlog: Option<RunLog>,
    config: SchedulerConfig,
    max_depth: u32,
}

impl Scheduler {
    /// Create a scheduler with default retry and delegation limits.
    #[must_use]
    pub fn new(workers: WorkerRegistry, gates: GateRegistry) -> Self {
        Self {
            workers,
            gates,
            evaluator: Arc::new(FirstSuccess),
            knowledge: None,
            default_k: DEFAULT_RETRIEVAL_K,
            runlog: None,
            config: SchedulerConfig::default(),
            max_depth: DelegationConfig::default().max_depth,
        }
    }

    /// Use the given retry and revision limits.
    #[must_use]
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use the given delegation depth limit.
    #[must_use]
    pub fn with_delegation(mut self, config: &DelegationConfig) -> Self {
        self.max_depth = config.max_depth;
        self
    }

    /// Evaluator for `select-best` managers. Defaults to [`FirstSuccess`].
    #[must_use]
    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Knowledge store queried for tasks that declare retrieval.
    #[must_use]
    pub fn with_knowledge(mut self, store: Arc<KnowledgeStore>, default_k: usize) -> Self {
        self.knowledge = Some(store);
        self.default_k = default_k;
        self
    }

    /// Persist history and snapshots to `runlog`.
    #[must_use]
    pub fn with_run_log(mut self, runlog: RunLog) -> Self {
        self.runlog = Some(runlog);
        self
    }

    /// The attached run log, if any.
    #[must_use]
    pub fn run_log(&self) -> Option<&RunLog> {
        self.runlog.as_ref()
    }

    /// Validate `spec` and create a run for it.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for malformed graphs or roles and gates
    /// missing from the registries. No run is created in that case.
    pub fn submit(&self, spec: WorkflowSpec) -> Result<WorkflowRun, ValidationError> {
        let validated = ValidatedSpec::new(spec)?;

        for phase in &validated.spec().phases {
            if !self.gates.contains(&phase.gate) {
                return Err(ValidationError::UnknownGate {
                    phase: phase.id.clone(),
                    gate: phase.gate.clone(),
                });
            }
            if let Some(task) = phase.tasks.iter().find(|t| !self.workers.contains(&t.role)) {
                return Err(ValidationError::UnknownRole {
                    task: task.id.clone(),
                    role: task.role.clone(),
                });
            }
        }

        let run = WorkflowRun::new(&validated);
        tracing::info!(
            run_id = %run.id,
            workflow = %run.workflow,
            tasks = run.tasks.len(),
            "Run submitted"
        );
        Ok(run)
    }

    /// Drive `run` until it finishes or suspends.
    ///
    /// # Errors
    ///
    /// Returns an error if the run is already finished or the run log fails.
    pub async fn execute(&self, run: &mut WorkflowRun) -> Result<RunStatus, SchedulerError> {
        self.execute_with_cancel(run, &CancellationToken::new()).await
    }

    /// Drive `run` until it finishes, suspends, or `cancel` fires.
    ///
    /// On cancellation in-flight worker calls are aborted and the run becomes
    /// `cancelled`.
    ///
    /// # Errors
    ///
    /// Returns an error if the run is already finished or the run log fails.
    pub async fn execute_with_cancel(
        &self,
        run: &mut WorkflowRun,
        cancel: &CancellationToken,
    ) -> Result<RunStatus, SchedulerError> {
        if run.status.is_terminal() {
            return Err(SchedulerError::RunFinished {
                run_id: run.id.clone(),
                status: run.status,
            });
        }
        if run.status == RunStatus::AwaitingInput {
            tracing::debug!(run_id = %run.id, "Run is awaiting input, nothing to dispatch");
            return Ok(run.status);
        }

        self.reconcile(run).await?;
        recover_interrupted(run);
        run.status = RunStatus::Running;
        tracing::info!(run_id = %run.id, workflow = %run.workflow, "Executing run");
        self.persist(run).await?;

        while run.current_phase < run.phases.len() {
            let idx = run.current_phase;
            if let PhaseEnd::Cancelled = self.run_phase(run, idx, cancel).await? {
                run.status = RunStatus::Cancelled;
                tracing::info!(run_id = %run.id, phase = %run.phases[idx].id, "Run cancelled");
                self.persist(run).await?;
                return Ok(run.status);
            }

            run.status = RunStatus::AwaitingGate;
            self.persist(run).await?;
            if let Some(status) = self.apply_gate(run, idx).await? {
                return Ok(status);
            }
        }

        run.status = RunStatus::Completed;
        tracing::info!(run_id = %run.id, "Run completed");
        self.persist(run).await?;
        Ok(run.status)
    }

    /// Resume a suspended run held by the caller.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NotAwaitingInput`] unless the run is
    /// suspended, or a run log error.
    pub async fn resume(
        &self,
        run: &mut WorkflowRun,
        input: &HumanInput,
    ) -> Result<CheckpointAck, CheckpointError> {
        let ack = checkpoint::resume(run, input)?;
        let entry = run.record(
            ack.phase_id.clone(),
            Outcome::Resumed,
            Some(input.selection.clone()),
        );
        self.log_entry(&run.id, &entry).await?;
        self.persist(run).await?;
        Ok(ack)
    }

    /// Resume a persisted run with human input.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NoRunLog`] without a run log,
    /// [`CheckpointError::RunNotFound`] for unknown ids, and
    /// [`CheckpointError::NotAwaitingInput`] if the run is not suspended.
    pub async fn submit_input(
        &self,
        run_id: &str,
        selection: impl Into<String>,
        feedback: Option<String>,
    ) -> Result<CheckpointAck, CheckpointError> {
        let runlog = self.runlog.as_ref().ok_or(CheckpointError::NoRunLog)?;
        let mut run = runlog
            .load_snapshot(run_id)
            .await?
            .ok_or_else(|| CheckpointError::RunNotFound(run_id.to_string()))?;
        self.reconcile(&mut run).await?;
        self.resume(&mut run, &HumanInput::new(selection, feedback))
            .await
    }

    /// Load a persisted run.
    ///
    /// # Errors
    ///
    /// Returns an error if the run log cannot be read.
    pub async fn load_run(&self, run_id: &str) -> Result<Option<WorkflowRun>, SchedulerError> {
        let Some(runlog) = &self.runlog else {
            return Ok(None);
        };
        let Some(mut run) = runlog.load_snapshot(run_id).await? else {
            return Ok(None);
        };
        self.reconcile(&mut run).await?;
        Ok(Some(run))
    }

    /// Catch the run's history up with entries logged after its snapshot.
    async fn reconcile(&self, run: &mut WorkflowRun) -> Result<(), RunLogError> {
        let Some(runlog) = &self.runlog else {
            return Ok(());
        };
        let persisted = runlog.history(&run.id).await?;
        let logged = persisted.len();
        if run.adopt_history(persisted) {
            tracing::info!(run_id = %run.id, entries = logged, "History restored from run log");
        }
        Ok(())
    }

    async fn persist(&self, run: &WorkflowRun) -> Result<(), RunLogError> {
        match &self.runlog {
            Some(runlog) => runlog.save_snapshot(run).await,
            None => Ok(()),
        }
    }

    async fn log_entry(&self, run_id: &str, entry: &HistoryEntry) -> Result<(), RunLogError> {
        match &self.runlog {
            Some(runlog) => runlog.append(run_id, entry).await,
            None => Ok(()),
        }
    }

    async fn record(
        &self,
        run: &mut WorkflowRun,
        task_id: &str,
        outcome: Outcome,
        detail: Option<String>,
    ) -> Result<(), SchedulerError> {
        let entry = run.record(task_id, outcome, detail);
        self.log_entry(&run.id, &entry).await?;
        Ok(())
    }

    /// Evaluate the gate of phase `idx`. Returns a status if the run stops here.
    async fn apply_gate(
        &self,
        run: &mut WorkflowRun,
        idx: usize,
    ) -> Result<Option<RunStatus>, SchedulerError> {
        let outputs = phase_outputs(run, idx);
        let phase_id = run.phases[idx].id.clone();
        let gate_name = run.phases[idx].gate.clone();

        let Some(gate) = self.gates.get(&gate_name) else {
            let reason = format!("Gate '{gate_name}' is not registered");
            self.fail_run(run, idx, reason, Vec::new()).await?;
            return Ok(Some(run.status));
        };
        let decision = gate.evaluate(&outputs).await;
        tracing::info!(
            run_id = %run.id,
            phase = %phase_id,
            decision = decision.as_str(),
            failed = outputs.failed.len(),
            "Gate evaluated"
        );

        match decision {
            GateDecision::Approve => {
                self.record(run, &phase_id, Outcome::GateApproved, None).await?;
                if let Some(first) = outputs.failed.first() {
                    let chain = run.causal_chain(first);
                    let reason = format!("Phase '{phase_id}' has failed tasks");
                    self.fail_run(run, idx, reason, chain).await?;
                    return Ok(Some(run.status));
                }
                if run.phases[idx].checkpoint {
                    checkpoint::suspend(run)?;
                    self.record(run, &phase_id, Outcome::Suspended, None).await?;
                    self.persist(run).await?;
                    return Ok(Some(run.status));
                }
                run.current_phase += 1;
                run.status = RunStatus::Running;
                self.persist(run).await?;
                Ok(None)
            }
            GateDecision::Revise(ids) => {
                self.record(run, &phase_id, Outcome::GateRevised, Some(ids.join(", ")))
                    .await?;
                run.phases[idx].revisions += 1;
                let revisions = run.phases[idx].revisions;
                if revisions > self.config.max_revisions_per_phase {
                    let reason = format!(
                        "Phase '{phase_id}' exceeded {} revisions",
                        self.config.max_revisions_per_phase
                    );
                    self.fail_run(run, idx, reason, Vec::new()).await?;
                    return Ok(Some(run.status));
                }
                let unknown: Vec<&String> = ids
                    .iter()
                    .filter(|id| !run.phases[idx].task_ids.contains(id))
                    .collect();
                if !unknown.is_empty() {
                    let reason = format!(
                        "Gate requested revision of tasks outside phase '{phase_id}': {}",
                        unknown.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
                    );
                    self.fail_run(run, idx, reason, Vec::new()).await?;
                    return Ok(Some(run.status));
                }
                self.revise(run, idx, &ids).await?;
                run.status = RunStatus::Running;
                Ok(None)
            }
            GateDecision::Reject(reason) => {
                self.record(run, &phase_id, Outcome::GateRejected, Some(reason.clone()))
                    .await?;
                let causal_chain = outputs
                    .failed
                    .first()
                    .map(|first| run.causal_chain(first))
                    .unwrap_or_default();
                tracing::warn!(run_id = %run.id, phase = %phase_id, reason = %reason, "Run rejected");
                run.failure = Some(RunFailure {
                    phase_id,
                    reason,
                    causal_chain,
                });
                run.status = RunStatus::Rejected;
                self.persist(run).await?;
                Ok(Some(run.status))
            }
        }
    }

    async fn fail_run(
        &self,
        run: &mut WorkflowRun,
        idx: usize,
        reason: String,
        causal_chain: Vec<String>,
    ) -> Result<(), SchedulerError> {
        let phase_id = run.phases[idx].id.clone();
        tracing::error!(
            run_id = %run.id,
            phase = %phase_id,
            reason = %reason,
            chain = ?causal_chain,
            "Run failed"
        );
        run.failure = Some(RunFailure {
            phase_id,
            reason,
            causal_chain,
        });
        run.status = RunStatus::Failed;
        self.persist(run).await?;
        Ok(())
    }

    /// Reset `ids` and every task of the phase depending on them.
    ///
    /// Only the listed tasks' context keys are cleared; dependents keep
    /// theirs until a newer revision overwrites them.
    async fn revise(
        &self,
        run: &mut WorkflowRun,
        idx: usize,
        ids: &[String],
    ) -> Result<(), SchedulerError> {
        for id in ids {
            discard_children(run, id);
        }
        let cleared = run.context.revise(ids);
        tracing::debug!(run_id = %run.id, cleared = ?cleared, "Context revised");

        let mut affected: Vec<String> = ids.to_vec();
        let mut dependents = Vec::new();
        loop {
            let next: Vec<String> = run
                .phase_tasks(idx)
                .filter(|t| !affected.contains(&t.id))
                .filter(|t| t.depends_on.iter().any(|d| affected.contains(d)))
                .map(|t| t.id.clone())
                .collect();
            if next.is_empty() {
                break;
            }
            affected.extend(next.iter().cloned());
            dependents.extend(next);
        }

        for id in ids {
            if let Some(task) = run.task_mut(id) {
                task.reset();
                let detail = format!("revision {}", task.revision);
                self.record(run, id, Outcome::Revised, Some(detail)).await?;
            }
        }
        for id in &dependents {
            discard_children(run, id);
            if let Some(task) = run.task_mut(id) {
                task.reset();
                let detail = format!("revision {} (dependent)", task.revision);
                self.record(run, id, Outcome::Revised, Some(detail)).await?;
            }
        }
        Ok(())
    }

    async fn run_phase(
        &self,
        run: &mut WorkflowRun,
        idx: usize,
        cancel: &CancellationToken,
    ) -> Result<PhaseEnd, SchedulerError> {
        let limit = run.phases[idx].concurrency.limit();
        let mut ctx = PhaseLoop::new();
        tracing::info!(
            run_id = %run.id,
            phase = %run.phases[idx].id,
            limit,
            "Phase started"
        );

        loop {
            promote_ready(run, idx, &ctx.backing_off);
            while ctx.in_flight < limit {
                let Some(task_id) = next_ready(run, idx) else {
                    break;
                };
                self.dispatch(run, &task_id, &mut ctx).await?;
                promote_ready(run, idx, &ctx.backing_off);
            }

            if ctx.join.is_empty() {
                break;
            }

            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                joined = ctx.join.join_next() => joined,
            };
            let completion = match next {
                Some(Ok(completion)) => completion,
                Some(Err(e)) => {
                    tracing::error!(run_id = %run.id, error = %e, "Phase task aborted");
                    continue;
                }
                None if cancel.is_cancelled() => {
                    ctx.join.abort_all();
                    for task in run.tasks.iter_mut().filter(|t| t.phase_index == idx) {
                        if matches!(task.status, TaskStatus::Running | TaskStatus::Ready) {
                            task.status = TaskStatus::Pending;
                        }
                    }
                    return Ok(PhaseEnd::Cancelled);
                }
                None => break,
            };
            self.handle(run, completion, &mut ctx).await?;
        }

        let stranded: Vec<String> = run
            .tasks
            .iter()
            .filter(|t| t.phase_index == idx && !t.status.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        for id in stranded {
            tracing::warn!(run_id = %run.id, task_id = %id, "Task could never become ready");
            if let Some(task) = run.task_mut(&id) {
                task.status = TaskStatus::Skipped;
                task.failure = Some(TaskFailure::new(
                    FailureKind::DependencyFailed,
                    "Dependencies never completed",
                ));
            }
            self.record(run, &id, Outcome::Skipped, None).await?;
        }

        tracing::info!(run_id = %run.id, phase = %run.phases[idx].id, "Phase settled");
        Ok(PhaseEnd::Settled)
    }

    async fn dispatch(
        &self,
        run: &mut WorkflowRun,
        task_id: &str,
        ctx: &mut PhaseLoop,
    ) -> Result<(), SchedulerError> {
        let Some(task) = run.task_mut(task_id) else {
            return Ok(());
        };
        task.status = TaskStatus::Running;
        task.attempts += 1;
        let node = task.clone();

        self.record(
            run,
            task_id,
            Outcome::Dispatched,
            Some(format!("attempt {}", node.attempts)),
        )
        .await?;
        tracing::debug!(
            run_id = %run.id,
            task_id = %task_id,
            role = %node.role,
            attempt = node.attempts,
            "Task dispatched"
        );

        let mut inputs = match run.context.read(&node.inputs) {
            Ok(inputs) => inputs,
            Err(e) => {
                let failure = TaskFailure::new(FailureKind::MissingContext, e.to_string());
                return self.fail_task(run, task_id, failure, ctx).await;
            }
        };

        let Some(worker) = self.workers.get(&node.role) else {
            let failure = TaskFailure::new(
                FailureKind::Worker,
                format!("No worker registered for role '{}'", node.role),
            );
            return self.fail_task(run, task_id, failure, ctx).await;
        };

        let plan = match &node.retrieval {
            None => RetrievalPlan::None,
            Some(request) => match run
                .context
                .entry(&retrieval_key(task_id))
                .filter(|e| e.attempt == node.revision)
            {
                Some(entry) => RetrievalPlan::Cached(entry.value.clone()),
                None => RetrievalPlan::Query {
                    query: request.query.clone(),
                    k: request.k.unwrap_or(self.default_k),
                },
            },
        };
        if let RetrievalPlan::Cached(value) = &plan {
            inputs.insert(RETRIEVAL_INPUT.to_string(), value.clone());
        }

        let mut request = TaskRequest {
            run_id: run.id.clone(),
            task_id: task_id.to_string(),
            role: node.role.clone(),
            inputs,
            depth: node.depth,
            attempt: node.attempts,
            revision: node.revision,
        };
        let knowledge = self.knowledge.clone();
        let is_manager = node.kind.is_manager();
        let id = task_id.to_string();

        let call = async move {
            let retrieval = match plan {
                RetrievalPlan::None | RetrievalPlan::Cached(_) => None,
                RetrievalPlan::Query { query, k } => {
                    let result = match knowledge {
                        Some(store) => store.query(&query, k).await,
                        None => RetrievalResult::failed("No knowledge store attached"),
                    };
                    let value = serde_json::to_value(&result).unwrap_or_default();
                    request
                        .inputs
                        .insert(RETRIEVAL_INPUT.to_string(), value.clone());
                    Some(value)
                }
            };
            if is_manager {
                Completion::Delegated {
                    task_id: request.task_id.clone(),
                    retrieval,
                    result: worker.delegate(&request).await,
                }
            } else {
                Completion::Executed {
                    task_id: request.task_id.clone(),
                    retrieval,
                    result: worker.execute(&request).await,
                }
            }
        };

        ctx.join.spawn(async move {
            match AbortOnDropHandle::new(tokio::spawn(call)).await {
                Ok(completion) => completion,
                Err(e) => Completion::Executed {
                    task_id: id,
                    retrieval: None,
                    result: Err(WorkerError::Fatal(format!("Worker panicked: {e}"))),
                },
            }
        });
        ctx.in_flight += 1;
        Ok(())
    }

    async fn handle(
        &self,
        run: &mut WorkflowRun,
        completion: Completion,
        ctx: &mut PhaseLoop,
    ) -> Result<(), SchedulerError> {
        match completion {
            Completion::Executed {
                task_id,
                retrieval,
                result,
            } => {
                ctx.in_flight -= 1;
                store_retrieval(run, &task_id, retrieval);
                match result {
                    Ok(output) => self.complete_task(run, &task_id, output, ctx).await,
                    Err(e) => self.worker_failed(run, &task_id, e, ctx).await,
                }
            }
            Completion::Delegated {
                task_id,
                retrieval,
                result,
            } => {
                ctx.in_flight -= 1;
                store_retrieval(run, &task_id, retrieval);
                match result {
                    Ok(children) => self.start_children(run, &task_id, children, ctx).await,
                    Err(e) => self.worker_failed(run, &task_id, e, ctx).await,
                }
            }
            Completion::Aggregated { task_id, result } => {
                ctx.aggregating.remove(&task_id);
                match result {
                    Ok(output) => self.complete_task(run, &task_id, output, ctx).await,
                    Err(e) => {
                        let caused_by = match &e {
                            DelegationError::ChildFailed { child } => Some(child.clone()),
                            DelegationError::NoSuccessfulChild => {
                                run.task(&task_id).and_then(|t| {
                                    t.children
                                        .iter()
                                        .find(|c| {
                                            run.status_of(c) == Some(TaskStatus::Failed)
                                        })
                                        .cloned()
                                })
                            }
                            _ => None,
                        };
                        let mut failure = TaskFailure::new(FailureKind::Delegation, e.to_string());
                        failure.caused_by = caused_by;
                        self.fail_task(run, &task_id, failure, ctx).await
                    }
                }
            }
            Completion::BackoffElapsed { task_id } => {
                ctx.backing_off.remove(&task_id);
                if let Some(task) = run.task_mut(&task_id) {
                    if task.status == TaskStatus::Pending {
                        task.status = TaskStatus::Ready;
                    }
                }
                Ok(())
            }
        }
    }

    async fn complete_task(
        &self,
        run: &mut WorkflowRun,
        task_id: &str,
        output: Value,
        ctx: &mut PhaseLoop,
    ) -> Result<(), SchedulerError> {
        let Some(revision) = run.task(task_id).map(|t| t.revision) else {
            return Ok(());
        };
        if let Err(e) = run.context.write(task_id, revision, output) {
            let failure = TaskFailure::new(FailureKind::Context, e.to_string());
            return self.fail_task(run, task_id, failure, ctx).await;
        }
        if let Some(task) = run.task_mut(task_id) {
            task.status = TaskStatus::Completed;
        }
        self.record(run, task_id, Outcome::Completed, None).await?;
        tracing::info!(run_id = %run.id, task_id = %task_id, "Task completed");
        self.maybe_aggregate(run, task_id, ctx);
        Ok(())
    }

    async fn worker_failed(
        &self,
        run: &mut WorkflowRun,
        task_id: &str,
        error: WorkerError,
        ctx: &mut PhaseLoop,
    ) -> Result<(), SchedulerError> {
        let attempts = run.task(task_id).map_or(0, |t| t.attempts);

        if error.is_transient() && attempts < self.config.max_attempts {
            let delay = self.config.backoff(attempts);
            if let Some(task) = run.task_mut(task_id) {
                task.status = TaskStatus::Pending;
            }
            let detail = format!("{error}; retrying in {}ms", delay.as_millis());
            self.record(run, task_id, Outcome::Retrying, Some(detail))
                .await?;
            tracing::warn!(
                run_id = %run.id,
                task_id = %task_id,
                attempt = attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "Transient failure, retrying"
            );

            ctx.backing_off.insert(task_id.to_string());
            let id = task_id.to_string();
            ctx.join.spawn(async move {
                tokio::time::sleep(delay).await;
                Completion::BackoffElapsed { task_id: id }
            });
            return Ok(());
        }

        let kind = if error.is_transient() {
            FailureKind::RetriesExhausted
        } else {
            FailureKind::Worker
        };
        self.fail_task(run, task_id, TaskFailure::new(kind, error.to_string()), ctx)
            .await
    }

    /// Mark `task_id` failed and skip everything that transitively depends on it.
    async fn fail_task(
        &self,
        run: &mut WorkflowRun,
        task_id: &str,
        failure: TaskFailure,
        ctx: &mut PhaseLoop,
    ) -> Result<(), SchedulerError> {
        let message = failure.message.clone();
        let Some(task) = run.task_mut(task_id) else {
            return Ok(());
        };
        task.status = TaskStatus::Failed;
        task.failure = Some(failure);
        let phase_index = task.phase_index;

        self.record(run, task_id, Outcome::Failed, Some(message.clone()))
            .await?;
        tracing::error!(run_id = %run.id, task_id = %task_id, error = %message, "Task failed");

        let mut frontier = vec![task_id.to_string()];
        while let Some(failed) = frontier.pop() {
            let dependents: Vec<String> = run
                .tasks
                .iter()
                .filter(|t| t.phase_index == phase_index)
                .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Ready))
                .filter(|t| t.depends_on.contains(&failed))
                .map(|t| t.id.clone())
                .collect();
            for id in dependents {
                if let Some(task) = run.task_mut(&id) {
                    task.status = TaskStatus::Skipped;
                    task.failure = Some(
                        TaskFailure::new(
                            FailureKind::DependencyFailed,
                            format!("Dependency '{failed}' did not complete"),
                        )
                        .caused_by(failed.clone()),
                    );
                }
                self.record(run, &id, Outcome::Skipped, Some(failed.clone()))
                    .await?;
                tracing::debug!(run_id = %run.id, task_id = %id, cause = %failed, "Task skipped");
                ctx.backing_off.remove(&id);
                frontier.push(id);
            }
        }

        self.maybe_aggregate(run, task_id, ctx);
        Ok(())
    }

    async fn start_children(
        &self,
        run: &mut WorkflowRun,
        manager_id: &str,
        children: Vec<DelegatedTask>,
        ctx: &mut PhaseLoop,
    ) -> Result<(), SchedulerError> {
        let Some(manager) = run.task(manager_id).cloned() else {
            return Ok(());
        };
        discard_children(run, manager_id);

        if !children.is_empty() {
            let checked = child_depth(manager.depth, self.max_depth)
                .and_then(|depth| validate_children(&children).map(|()| depth));
            let depth = match checked {
                Ok(depth) => depth,
                Err(e) => {
                    let failure = TaskFailure::new(FailureKind::Delegation, e.to_string());
                    return self.fail_task(run, manager_id, failure, ctx).await;
                }
            };

            let mut ids = Vec::with_capacity(children.len());
            for child in children {
                let id = child_task_id(manager_id, &child.name);
                let depends_on: Vec<String> = child
                    .depends_on
                    .iter()
                    .map(|dep| child_task_id(manager_id, dep))
                    .collect();
                let mut inputs = manager.inputs.clone();
                inputs.extend(depends_on.iter().cloned());
                let ordinal = run.next_ordinal();
                run.tasks.push(TaskNode {
                    id: id.clone(),
                    phase_id: manager.phase_id.clone(),
                    phase_index: manager.phase_index,
                    role: child.role,
                    kind: child.kind,
                    depends_on,
                    inputs,
                    retrieval: None,
                    depth,
                    ordinal,
                    parent: Some(manager_id.to_string()),
                    children: Vec::new(),
                    status: TaskStatus::Pending,
                    revision: 1,
                    attempts: 0,
                    failure: None,
                });
                ids.push(id);
            }
            if let Some(task) = run.task_mut(manager_id) {
                task.children.clone_from(&ids);
            }
        }

        let count = run.task(manager_id).map_or(0, |t| t.children.len());
        self.record(
            run,
            manager_id,
            Outcome::Delegated,
            Some(format!("{count} children")),
        )
        .await?;
        tracing::info!(run_id = %run.id, task_id = %manager_id, children = count, "Task delegated");

        if count == 0 {
            self.spawn_aggregation(run, manager_id, ctx);
        }
        Ok(())
    }

    /// Start aggregation for the parent of `task_id` once all its children are terminal.
    fn maybe_aggregate(&self, run: &WorkflowRun, task_id: &str, ctx: &mut PhaseLoop) {
        let Some(parent_id) = run.task(task_id).and_then(|t| t.parent.clone()) else {
            return;
        };
        let Some(parent) = run.task(&parent_id) else {
            return;
        };
        let settled = parent
            .children
            .iter()
            .all(|c| run.status_of(c).is_some_and(|s| s.is_terminal()));
        if parent.status == TaskStatus::Running && settled {
            self.spawn_aggregation(run, &parent_id, ctx);
        }
    }

    fn spawn_aggregation(&self, run: &WorkflowRun, manager_id: &str, ctx: &mut PhaseLoop) {
        if !ctx.aggregating.insert(manager_id.to_string()) {
            return;
        }
        let Some(manager) = run.task(manager_id) else {
            return;
        };
        let strategy = manager
            .kind
            .aggregation()
            .unwrap_or(AggregationStrategy::Merge);
        let children: Vec<ChildOutcome> = manager
            .children
            .iter()
            .filter_map(|id| run.task(id))
            .map(|child| {
                let name = child_name(manager_id, &child.id);
                match (child.status, run.context.get(&child.id)) {
                    (TaskStatus::Completed, Some(output)) => {
                        ChildOutcome::completed(name, child.id.clone(), output.clone())
                    }
                    _ => ChildOutcome::failed(name, child.id.clone()),
                }
            })
            .collect();

        let evaluator = self.evaluator.clone();
        let id = manager_id.to_string();
        let call = {
            let id = id.clone();
            async move { aggregate(&id, strategy, &children, Some(evaluator.as_ref())).await }
        };
        ctx.join.spawn(async move {
            let result = match AbortOnDropHandle::new(tokio::spawn(call)).await {
                Ok(result) => result,
                Err(e) => Err(DelegationError::Evaluator(format!("Aggregation panicked: {e}"))),
            };
            Completion::Aggregated { task_id: id, result }
        });
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.workers)
            .field("gates", &self.gates)
            .field("config", &self.config)
            .field("max_depth", &self.max_depth)
            .finish_non_exhaustive()
    }
}

/// Return tasks of the current phase that were in flight when the run stopped to `pending`.
fn recover_interrupted(run: &mut WorkflowRun) {
    let idx = run.current_phase;
    let interrupted: Vec<String> = run
        .tasks
        .iter()
        .filter(|t| t.phase_index == idx && t.parent.is_none())
        .filter(|t| matches!(t.status, TaskStatus::Running | TaskStatus::Ready))
        .map(|t| t.id.clone())
        .collect();
    for id in interrupted {
        discard_children(run, &id);
        if let Some(task) = run.task_mut(&id) {
            task.status = TaskStatus::Pending;
        }
        tracing::debug!(run_id = %run.id, task_id = %id, "Interrupted task reset");
    }
}

fn child_name(manager_id: &str, child_id: &str) -> String {
    child_id
        .strip_prefix(manager_id)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(child_id)
        .to_string()
}

/// Move pending tasks of phase `idx` whose dependencies all completed to `ready`.
fn promote_ready(run: &mut WorkflowRun, idx: usize, backing_off: &HashSet<String>) {
    let ready: Vec<String> = run
        .tasks
        .iter()
        .filter(|t| t.phase_index == idx && t.status == TaskStatus::Pending)
        .filter(|t| !backing_off.contains(&t.id))
        .filter(|t| {
            t.depends_on
                .iter()
                .all(|d| run.status_of(d) == Some(TaskStatus::Completed))
        })
        .map(|t| t.id.clone())
        .collect();
    for id in ready {
        if let Some(task) = run.task_mut(&id) {
            task.status = TaskStatus::Ready;
        }
    }
}

/// First ready task of phase `idx` in declaration order.
fn next_ready(run: &WorkflowRun, idx: usize) -> Option<String> {
    run.tasks
        .iter()
        .filter(|t| t.phase_index == idx && t.status == TaskStatus::Ready)
        .min_by_key(|t| t.ordinal)
        .map(|t| t.id.clone())
}

/// Remove a manager's delegated descendants and their context entries.
fn discard_children(run: &mut WorkflowRun, manager_id: &str) {
    let mut doomed = Vec::new();
    let mut pending = vec![manager_id.to_string()];
    while let Some(id) = pending.pop() {
        if let Some(task) = run.task(&id) {
            for child in &task.children {
                doomed.push(child.clone());
                pending.push(child.clone());
            }
        }
    }
    if doomed.is_empty() {
        return;
    }
    run.context.revise(&doomed);
    run.tasks.retain(|t| !doomed.contains(&t.id));
    if let Some(task) = run.task_mut(manager_id) {
        task.children.clear();
    }
}

/// Write retrieval results under `retrieval:<task>` once per revision.
fn store_retrieval(run: &mut WorkflowRun, task_id: &str, retrieval: Option<Value>) {
    let Some(value) = retrieval else {
        return;
    };
    let Some(revision) = run.task(task_id).map(|t| t.revision) else {
        return;
    };
    if let Err(e) = run.context.write(retrieval_key(task_id), revision, value) {
        tracing::debug!(task_id = %task_id, error = %e, "Retrieval already stored");
    }
}

fn phase_outputs(run: &WorkflowRun, idx: usize) -> PhaseOutputs {
    let mut outputs = PhaseOutputs {
        run_id: run.id.clone(),
        phase_id: run.phases[idx].id.clone(),
        revisions: run.phases[idx].revisions,
        ..PhaseOutputs::default()
    };
    for task in run.phase_tasks(idx) {
        match task.status {
            TaskStatus::Completed => {
                if let Some(value) = run.context.get(&task.id) {
                    outputs.outputs.insert(task.id.clone(), value.clone());
                }
            }
            TaskStatus::Failed => outputs.failed.push(task.id.clone()),
            TaskStatus::Skipped => outputs.skipped.push(task.id.clone()),
            _ => {}
        }
    }
    outputs
}
