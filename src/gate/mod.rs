//! Quality gates evaluated at phase boundaries.

mod evaluator;
mod registry;

pub use evaluator::*;
pub use registry::GateRegistry;
