//! Colored CLI display utilities.
//!
//! Rendering for validated workflows, ingestion reports, retrieval results
//! and run history.

use std::io::{self, Write};

use chrono::Utc;
use owo_colors::OwoColorize;

use crate::checkpoint::CheckpointAck;
use crate::knowledge::{IngestReport, KnowledgeStats, RetrievalResult};
use crate::runlog::RunSummary;
use crate::scheduler::{HistoryEntry, Outcome, RunStatus};
use crate::workflow::ValidatedSpec;

/// Get current timestamp in the same format as tracing.
fn timestamp() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Truncate a string to at most `max_len` characters, adding ellipsis if truncated.
#[must_use]
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{head}...")
    }
}

/// Bracketed tag shown for a history outcome.
#[must_use]
pub fn outcome_tag(outcome: Outcome) -> String {
    format!("[{}]", outcome.as_str().to_uppercase())
}

/// Print the layout of a validated workflow.
pub fn print_workflow(spec: &ValidatedSpec) {
    println!(
        "{} {} workflow={}",
        timestamp().dimmed(),
        "[VALID]".green().bold(),
        spec.name().cyan()
    );
    for phase in &spec.spec().phases {
        let checkpoint = if phase.checkpoint { " checkpoint" } else { "" };
        println!(
            "  {} {} gate={} tasks={}{}",
            "phase".blue(),
            phase.id.bold(),
            phase.gate,
            phase.tasks.len(),
            checkpoint.yellow()
        );
        for task in &phase.tasks {
            let deps = if task.depends_on.is_empty() {
                String::new()
            } else {
                format!(" <- {}", task.depends_on.join(", "))
            };
            println!("    {} ({}){}", task.id, task.role.dimmed(), deps.dimmed());
        }
    }
    println!(
        "  {} {}",
        "order".blue(),
        spec.topological_order().join(" -> ").dimmed()
    );
    let _ = io::stdout().flush();
}

/// Print the result of an ingestion pass.
pub fn print_ingest_report(report: &IngestReport) {
    let tag = if report.failed.is_empty() {
        "[INGEST]".green().bold().to_string()
    } else {
        "[INGEST]".yellow().bold().to_string()
    };
    println!(
        "{} {} embedded={} unchanged={} tombstoned={} failed={}",
        timestamp().dimmed(),
        tag,
        report.embedded.len(),
        report.skipped_unchanged,
        report.tombstoned.len(),
        report.failed.len()
    );
    for id in &report.failed {
        println!("  {} {}", "failed".red(), id);
    }
    let _ = io::stdout().flush();
}

/// Print knowledge store health.
pub fn print_stats(stats: &KnowledgeStats) {
    println!(
        "{} {} live={} tombstoned={}",
        timestamp().dimmed(),
        "[INDEX]".blue().bold(),
        stats.live,
        stats.tombstoned
    );
}

/// Print ranked retrieval hits.
pub fn print_retrieval(query: &str, result: &RetrievalResult) {
    println!(
        "{} {} {}",
        timestamp().dimmed(),
        "[QUERY]".blue().bold(),
        truncate(query, 80).cyan()
    );
    if let Some(error) = &result.error {
        println!("  {} {}", "[ERROR]".red().bold(), error.red());
        return;
    }
    if result.is_empty() {
        println!("  {}", "no matching documents".dimmed());
        return;
    }
    for (rank, hit) in result.hits.iter().enumerate() {
        println!("  {:>2}. {:.4} {}", rank + 1, hit.score, hit.document_id);
        let excerpt = hit.content.split_whitespace().collect::<Vec<_>>().join(" ");
        println!("      {}", truncate(&excerpt, 80).dimmed());
    }
    let _ = io::stdout().flush();
}

/// Print a run's history, oldest first.
pub fn print_history(run_id: &str, entries: &[HistoryEntry]) {
    println!(
        "{} {} run={} events={}",
        timestamp().dimmed(),
        "[HISTORY]".blue().bold(),
        run_id.cyan(),
        entries.len()
    );
    for entry in entries {
        let tag = outcome_tag(entry.outcome);
        let tag = match entry.outcome {
            Outcome::Completed | Outcome::GateApproved | Outcome::Resumed => {
                tag.green().to_string()
            }
            Outcome::Failed | Outcome::GateRejected => tag.red().to_string(),
            Outcome::Retrying | Outcome::Skipped | Outcome::GateRevised | Outcome::Revised => {
                tag.yellow().to_string()
            }
            Outcome::Dispatched
            | Outcome::Delegated
            | Outcome::Suspended => tag.blue().to_string(),
        };
        let detail = entry
            .detail
            .as_deref()
            .map(|d| truncate(d, 100))
            .unwrap_or_default();
        println!(
            "  {:>4} {} {} {} {}",
            entry.seq,
            entry.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
            tag,
            entry.task_id,
            detail.dimmed()
        );
    }
    let _ = io::stdout().flush();
}

/// Print the list of persisted runs.
pub fn print_runs(runs: &[RunSummary]) {
    if runs.is_empty() {
        println!("{}", "No runs recorded".dimmed());
        return;
    }
    for run in runs {
        let status = match run.status {
            RunStatus::Completed => run.status.green().to_string(),
            RunStatus::Failed | RunStatus::Rejected => run.status.red().to_string(),
            RunStatus::AwaitingInput | RunStatus::AwaitingGate => {
                run.status.yellow().to_string()
            }
            _ => run.status.to_string(),
        };
        println!(
            "{} {} {} {}",
            run.updated_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            run.id.cyan(),
            run.workflow,
            status
        );
    }
}

/// Print a checkpoint acknowledgement.
pub fn print_ack(ack: &CheckpointAck) {
    println!(
        "{} {} run={} phase={} key={}",
        timestamp().dimmed(),
        "[RESUMED]".green().bold(),
        ack.run_id.cyan(),
        ack.phase_id,
        ack.handover_key.dimmed()
    );
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!(
        "{} {} {}",
        timestamp().dimmed(),
        "[ERROR]".red().bold(),
        message.red()
    );
}
