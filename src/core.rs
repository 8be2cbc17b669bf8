//! Core abstractions and types.
//!
//! *Users* are mainly interested in implementing the [`NonlinearProblem`]
//! trait, optionally specifying the [domain](Domain).

mod base;
mod domain;
mod problem;

pub use base::*;
pub use domain::*;
pub use problem::*;
