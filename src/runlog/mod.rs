//! Persistent run log for crash recovery.

mod error;
mod schema;
mod store;

pub use error::RunLogError;
pub use schema::SCHEMA;
pub use store::{RunLog, RunSummary};
