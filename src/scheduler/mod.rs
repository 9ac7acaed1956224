//! Run execution.
//!
//! The [`Scheduler`] turns a validated workflow into a [`WorkflowRun`] and
//! drives it phase by phase: ready tasks are dispatched to role workers
//! within the phase's concurrency limit, transient failures are retried with
//! backoff, managers delegate child tasks, and each phase ends at its
//! quality gate.

mod engine;
mod error;
mod run;
mod worker;

pub use engine::Scheduler;
pub use error::{SchedulerError, WorkerError};
pub use run::*;
pub use worker::*;
