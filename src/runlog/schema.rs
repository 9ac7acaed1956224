//! Database schema for the run log.

/// SQL schema for the run log database.
pub const SCHEMA: &str = r"
PRAGMA journal_mode = WAL;

-- One row per run; snapshot holds the full serialized run state
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY NOT NULL,
    workflow TEXT NOT NULL,
    status TEXT NOT NULL,
    snapshot TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Append-only history, one row per event
CREATE TABLE IF NOT EXISTS history (
    run_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    task_id TEXT NOT NULL,
    outcome TEXT NOT NULL,
    detail TEXT,
    timestamp TEXT NOT NULL,
    PRIMARY KEY (run_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_history_task ON history(run_id, task_id);
CREATE INDEX IF NOT EXISTS idx_runs_updated_at ON runs(updated_at);
";
