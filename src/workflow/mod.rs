//! Declarative workflow specifications.
//!
//! A workflow is an ordered list of phases, each holding a list of
//! role-bound tasks. Specifications are parsed from TOML and validated once,
//! before any run is created.

mod error;
mod spec;
mod validate;

pub use error::ValidationError;
pub use spec::*;
pub use validate::ValidatedSpec;
