//! Integration tests for human checkpoints resumed through the run log.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use phaseflow::checkpoint::CheckpointError;
use phaseflow::gate::GateRegistry;
use phaseflow::runlog::RunLog;
use phaseflow::scheduler::{
    Outcome, RunStatus, Scheduler, TaskRequest, TaskStatus, Worker, WorkerError, WorkerRegistry,
};
use phaseflow::workflow::{PhaseSpec, TaskSpec, WorkflowSpec};

struct Echo;

#[async_trait]
impl Worker for Echo {
    async fn execute(&self, request: &TaskRequest) -> Result<Value, WorkerError> {
        Ok(json!({ "task": request.task_id, "inputs": request.inputs }))
    }
}

/// Helper to create a database path in a temp directory.
fn temp_db_path(temp_dir: &TempDir, name: &str) -> PathBuf {
    temp_dir.path().join(format!("{name}.db"))
}

fn pitch() -> WorkflowSpec {
    WorkflowSpec::new("pitch")
        .phase(
            PhaseSpec::new("concepts")
                .with_checkpoint()
                .task(TaskSpec::new("ideas", "writer")),
        )
        .phase(
            PhaseSpec::new("build").task(
                TaskSpec::new("draft", "writer").inputs(["handover:concepts", "ideas"]),
            ),
        )
}

async fn scheduler(temp_dir: &TempDir) -> Scheduler {
    let runlog = RunLog::open(temp_db_path(temp_dir, "runs"))
        .await
        .expect("Failed to open run log");
    Scheduler::new(
        WorkerRegistry::new().with("writer", Echo),
        GateRegistry::with_defaults(),
    )
    .with_run_log(runlog)
}

/// Test that a run suspends at its checkpoint and continues after input.
#[tokio::test]
async fn test_suspend_and_resume_through_run_log() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let scheduler = scheduler(&temp_dir).await;
    let mut run = scheduler.submit(pitch()).expect("valid spec");

    let status = scheduler.execute(&mut run).await.expect("run executes");
    assert_eq!(status, RunStatus::AwaitingInput);
    assert!(run.first_event("draft", Outcome::Dispatched).is_none());

    // No dispatch while suspended
    let events = run.history.len();
    assert_eq!(
        scheduler.execute(&mut run).await.expect("run executes"),
        RunStatus::AwaitingInput
    );
    assert_eq!(run.history.len(), events);

    let ack = scheduler
        .submit_input(&run.id, "concept-2", Some("warmer palette".to_string()))
        .await
        .expect("resume succeeds");
    assert_eq!(ack.run_id, run.id);
    assert_eq!(ack.phase_id, "concepts");
    assert_eq!(ack.handover_key, "handover:concepts");

    let mut resumed = scheduler
        .load_run(&run.id)
        .await
        .expect("run log readable")
        .expect("run persisted");
    assert_eq!(resumed.status, RunStatus::Running);
    assert_eq!(resumed.current_phase, 1);

    let status = scheduler.execute(&mut resumed).await.expect("run executes");
    assert_eq!(status, RunStatus::Completed);

    let draft = resumed.context.get("draft").expect("draft written");
    assert_eq!(
        draft["inputs"]["handover:concepts"],
        json!({ "selection": "concept-2", "feedback": "warmer palette" })
    );
    assert_eq!(draft["inputs"]["ideas"]["task"], json!("ideas"));
}

/// Test that the persisted history matches the run's own history in order.
#[tokio::test]
async fn test_history_persisted_in_order() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let scheduler = scheduler(&temp_dir).await;
    let mut run = scheduler.submit(pitch()).expect("valid spec");
    scheduler.execute(&mut run).await.expect("run executes");
    scheduler
        .submit_input(&run.id, "concept-1", None)
        .await
        .expect("resume succeeds");
    let mut run = scheduler.load_run(&run.id).await.unwrap().unwrap();
    scheduler.execute(&mut run).await.expect("run executes");

    let runlog = scheduler.run_log().expect("run log attached");
    let persisted = runlog.history(&run.id).await.expect("history readable");
    assert_eq!(persisted, run.history);
    assert!(persisted.windows(2).all(|w| w[0].seq < w[1].seq));

    let outcomes: Vec<Outcome> = persisted
        .iter()
        .filter(|e| e.task_id == "concepts")
        .map(|e| e.outcome)
        .collect();
    assert_eq!(
        outcomes,
        vec![Outcome::GateApproved, Outcome::Suspended, Outcome::Resumed]
    );

    let runs = runlog.list_runs().await.expect("runs listed");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Completed);
}

/// Test that resuming a run that is not suspended is rejected.
#[tokio::test]
async fn test_resume_requires_awaiting_input() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let scheduler = scheduler(&temp_dir).await;
    let mut run = scheduler.submit(pitch()).expect("valid spec");
    scheduler.execute(&mut run).await.expect("run executes");
    scheduler
        .submit_input(&run.id, "concept-1", None)
        .await
        .expect("first resume succeeds");

    let err = scheduler
        .submit_input(&run.id, "concept-1", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CheckpointError::NotAwaitingInput {
            status: RunStatus::Running,
            ..
        }
    ));
}

/// Test that unknown run ids are reported.
#[tokio::test]
async fn test_resume_unknown_run() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let scheduler = scheduler(&temp_dir).await;

    let err = scheduler
        .submit_input("no-such-run", "x", None)
        .await
        .unwrap_err();
    assert!(matches!(err, CheckpointError::RunNotFound(id) if id == "no-such-run"));
}

/// Test that resuming by id needs a run log.
#[tokio::test]
async fn test_resume_without_run_log() {
    let scheduler = Scheduler::new(
        WorkerRegistry::new().with("writer", Echo),
        GateRegistry::with_defaults(),
    );
    let err = scheduler.submit_input("any", "x", None).await.unwrap_err();
    assert!(matches!(err, CheckpointError::NoRunLog));
}

/// Test that a run survives reopening the log file.
#[tokio::test]
async fn test_snapshot_survives_reopen() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let run_id = {
        let scheduler = scheduler(&temp_dir).await;
        let mut run = scheduler.submit(pitch()).expect("valid spec");
        scheduler.execute(&mut run).await.expect("run executes");
        run.id
    };

    let scheduler = scheduler(&temp_dir).await;
    let run = scheduler
        .load_run(&run_id)
        .await
        .expect("run log readable")
        .expect("run persisted");
    assert_eq!(run.status, RunStatus::AwaitingInput);
    assert_eq!(run.context.get("ideas").unwrap()["task"], json!("ideas"));
}

/// Test that a run restored from a snapshot older than its log re-executes cleanly.
#[tokio::test]
async fn test_recovers_from_snapshot_behind_history() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let scheduler = scheduler(&temp_dir).await;
    let spec = WorkflowSpec::new("chain")
        .phase(
            PhaseSpec::new("draft")
                .task(TaskSpec::new("a", "writer"))
                .task(TaskSpec::new("b", "writer").depends_on(["a"]).inputs(["a"])),
        )
        .phase(PhaseSpec::new("polish").task(TaskSpec::new("c", "writer").inputs(["b"])));
    let mut run = scheduler.submit(spec).expect("valid spec");

    // State as persisted when the first phase started, with `a` in flight
    let mut stale = run.clone();
    stale.status = RunStatus::Running;
    stale.task_mut("a").unwrap().status = TaskStatus::Running;

    scheduler.execute(&mut run).await.expect("run executes");
    let logged = run.history.len();

    let runlog = scheduler.run_log().expect("run log attached");
    runlog.save_snapshot(&stale).await.expect("snapshot saved");

    let mut recovered = scheduler
        .load_run(&run.id)
        .await
        .expect("run log readable")
        .expect("run persisted");
    assert_eq!(recovered.history.len(), logged);

    let status = scheduler.execute(&mut recovered).await.expect("run executes");
    assert_eq!(status, RunStatus::Completed);
    assert_eq!(recovered.context.get("c").unwrap()["inputs"]["b"]["task"], json!("b"));

    let persisted = runlog.history(&run.id).await.expect("history readable");
    assert_eq!(persisted, recovered.history);
    assert!(persisted.windows(2).all(|w| w[0].seq < w[1].seq));
    let dispatches = persisted
        .iter()
        .filter(|e| e.task_id == "a" && e.outcome == Outcome::Dispatched)
        .count();
    assert_eq!(dispatches, 2);
}
