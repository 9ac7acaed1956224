//! Phaseflow - phased task-graph orchestration with a live knowledge store.
//!
//! Workflows are ordered phases of role-bound tasks. The [`scheduler`] runs
//! each phase's dependency graph on pluggable workers, ends every phase at a
//! quality gate, and can pause at human checkpoints. Tasks may pull ranked
//! documents from the [`knowledge`] store, which re-embeds only changed files.

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod delegation;
pub mod display;
pub mod gate;
pub mod knowledge;
pub mod runlog;
pub mod scheduler;
pub mod workflow;
