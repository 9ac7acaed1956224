//! Context propagation between tasks.
//!
//! Task outputs, retrieval results and human handover payloads are written
//! once per attempt and read by downstream tasks at dispatch time.

mod error;
mod store;

pub use error::ContextError;
pub use store::*;
