//! Run log implementation with async `SQLite` operations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::scheduler::{HistoryEntry, Outcome, RunStatus, WorkflowRun};

use super::error::RunLogError;
use super::schema::SCHEMA;

/// One row of the run listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub id: String,
    pub workflow: String,
    pub status: RunStatus,
    pub updated_at: DateTime<Utc>,
}

/// Append-only run history plus the latest snapshot of each run.
///
/// Uses `SQLite` for persistent storage with async operations via `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct RunLog {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl RunLog {
    /// Open a run log at the specified path.
    ///
    /// Creates parent directories if they don't exist and initializes the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema cannot be applied.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RunLogError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| RunLogError::CreateDir {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }

        let path_clone = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, RunLogError> {
            let conn =
                Connection::open(&path_clone).map_err(|source| RunLogError::DatabaseOpen {
                    path: path_clone,
                    source,
                })?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|_| RunLogError::TaskCancelled)??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Open an in-memory run log for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created or the schema cannot be applied.
    pub async fn open_in_memory() -> Result<Self, RunLogError> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection, RunLogError> {
            let conn = Connection::open_in_memory()?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|_| RunLogError::TaskCancelled)??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Returns the path to the database, if opened from a file.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Store the latest snapshot of `run`, replacing the previous one.
    ///
    /// # Errors
    ///
    /// Returns an error if the run cannot be serialized or written.
    pub async fn save_snapshot(&self, run: &WorkflowRun) -> Result<(), RunLogError> {
        let id = run.id.clone();
        let workflow = run.workflow.clone();
        let status = run.status.as_str();
        let snapshot = serde_json::to_string(run)?;
        let created_at = run.created_at.to_rfc3339();
        let updated_at = Utc::now().to_rfc3339();

        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<(), RunLogError> {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT OR REPLACE INTO runs (id, workflow, status, snapshot, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, workflow, status, snapshot, created_at, updated_at],
            )?;
            Ok(())
        })
        .await
        .map_err(|_| RunLogError::TaskCancelled)?
    }

    /// Load the latest snapshot of a run.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the snapshot cannot be decoded.
    pub async fn load_snapshot(&self, run_id: &str) -> Result<Option<WorkflowRun>, RunLogError> {
        let run_id = run_id.to_string();

        let conn = self.conn.clone();
        let snapshot = tokio::task::spawn_blocking(move || -> Result<Option<String>, RunLogError> {
            let conn = conn.blocking_lock();
            Ok(conn
                .query_row(
                    "SELECT snapshot FROM runs WHERE id = ?1",
                    params![run_id],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
        .map_err(|_| RunLogError::TaskCancelled)??;

        snapshot
            .map(|s| serde_json::from_str(&s).map_err(RunLogError::from))
            .transpose()
    }

    /// Append one history entry for `run_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be inserted, including a repeated `seq`.
    pub async fn append(&self, run_id: &str, entry: &HistoryEntry) -> Result<(), RunLogError> {
        let run_id = run_id.to_string();
        let seq = i64::try_from(entry.seq)
            .map_err(|_| RunLogError::Corrupt(format!("seq {} out of range", entry.seq)))?;
        let task_id = entry.task_id.clone();
        let outcome = entry.outcome.as_str();
        let detail = entry.detail.clone();
        let timestamp = entry.timestamp.to_rfc3339();

        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<(), RunLogError> {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO history (run_id, seq, task_id, outcome, detail, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![run_id, seq, task_id, outcome, detail, timestamp],
            )?;
            Ok(())
        })
        .await
        .map_err(|_| RunLogError::TaskCancelled)?
    }

    /// History of a run, ordered by `seq`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn history(&self, run_id: &str) -> Result<Vec<HistoryEntry>, RunLogError> {
        let run_id = run_id.to_string();

        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<HistoryEntry>, RunLogError> {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT seq, task_id, outcome, detail, timestamp
                 FROM history WHERE run_id = ?1 ORDER BY seq ASC",
            )?;

            let rows = stmt
                .query_map(params![run_id], |row| {
                    let seq: i64 = row.get(0)?;
                    let task_id: String = row.get(1)?;
                    let outcome: String = row.get(2)?;
                    let detail: Option<String> = row.get(3)?;
                    let timestamp: String = row.get(4)?;
                    Ok((seq, task_id, outcome, detail, timestamp))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(seq, task_id, outcome, detail, timestamp)| {
                    let outcome = Outcome::parse(&outcome)
                        .ok_or_else(|| RunLogError::Corrupt(format!("unknown outcome '{outcome}'")))?;
                    Ok(HistoryEntry {
                        seq: seq.unsigned_abs(),
                        task_id,
                        outcome,
                        detail,
                        timestamp: parse_timestamp(&timestamp)?,
                    })
                })
                .collect()
        })
        .await
        .map_err(|_| RunLogError::TaskCancelled)?
    }

    /// All runs, most recently updated first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn list_runs(&self) -> Result<Vec<RunSummary>, RunLogError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<RunSummary>, RunLogError> {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT id, workflow, status, updated_at FROM runs ORDER BY updated_at DESC",
            )?;

            let rows = stmt
                .query_map([], |row| {
                    let id: String = row.get(0)?;
                    let workflow: String = row.get(1)?;
                    let status: String = row.get(2)?;
                    let updated_at: String = row.get(3)?;
                    Ok((id, workflow, status, updated_at))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(id, workflow, status, updated_at)| {
                    let status = RunStatus::parse(&status)
                        .ok_or_else(|| RunLogError::Corrupt(format!("unknown status '{status}'")))?;
                    Ok(RunSummary {
                        id,
                        workflow,
                        status,
                        updated_at: parse_timestamp(&updated_at)?,
                    })
                })
                .collect()
        })
        .await
        .map_err(|_| RunLogError::TaskCancelled)?
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, RunLogError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RunLogError::Corrupt(format!("bad timestamp '{s}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{PhaseSpec, TaskSpec, ValidatedSpec, WorkflowSpec};

    fn run() -> WorkflowRun {
        let spec = WorkflowSpec::new("demo")
            .phase(PhaseSpec::new("p1").task(TaskSpec::new("a", "writer")));
        WorkflowRun::new(&ValidatedSpec::new(spec).unwrap())
    }

    #[tokio::test]
    async fn test_open_in_memory() {
        let log = RunLog::open_in_memory().await.unwrap();
        assert!(log.path().is_none());
    }

    #[tokio::test]
    async fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("runs.db");
        let log = RunLog::open(&path).await.unwrap();
        assert_eq!(log.path(), Some(path.as_path()));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let log = RunLog::open_in_memory().await.unwrap();
        let mut run = run();
        run.context.write("a", 1, serde_json::json!("done")).unwrap();
        log.save_snapshot(&run).await.unwrap();

        let loaded = log.load_snapshot(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded, run);
        assert!(log.load_snapshot("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_replaced() {
        let log = RunLog::open_in_memory().await.unwrap();
        let mut run = run();
        log.save_snapshot(&run).await.unwrap();
        run.status = RunStatus::Completed;
        log.save_snapshot(&run).await.unwrap();

        let runs = log.list_runs().await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);
        assert_eq!(runs[0].workflow, "demo");
    }

    #[tokio::test]
    async fn test_history_ordered_by_seq() {
        let log = RunLog::open_in_memory().await.unwrap();
        let mut run = run();
        let first = run.record("a", Outcome::Dispatched, Some("attempt 1".to_string()));
        let second = run.record("a", Outcome::Completed, None);
        log.append(&run.id, &second).await.unwrap();
        log.append(&run.id, &first).await.unwrap();

        let history = log.history(&run.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].outcome, Outcome::Dispatched);
        assert_eq!(history[0].detail.as_deref(), Some("attempt 1"));
        assert_eq!(history[1].seq, 2);
        assert!(log.history("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_seq_rejected() {
        let log = RunLog::open_in_memory().await.unwrap();
        let mut run = run();
        let entry = run.record("a", Outcome::Dispatched, None);
        log.append(&run.id, &entry).await.unwrap();
        assert!(log.append(&run.id, &entry).await.is_err());
    }
}
