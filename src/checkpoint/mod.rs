//! Human checkpoints: suspend a run until external input arrives.

mod error;
mod human;

pub use error::CheckpointError;
pub use human::*;
