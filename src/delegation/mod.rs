//! Manager/specialist delegation.
//!
//! A manager task asks its worker for child tasks, which run in the same
//! scheduler one delegation level deeper. Once every child is terminal the
//! manager's output is aggregated from the children's context entries.

mod aggregate;
mod error;
mod kind;

pub use aggregate::*;
pub use error::DelegationError;
pub use kind::*;
