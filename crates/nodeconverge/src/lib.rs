//! Declarative convergence of a machine towards a set of tasks.
//!
//! A run file declares tasks and their dependencies; the engine discovers
//! what exists, diffs it against the declaration, and renders only the
//! differences through the selected target.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fetch;
pub mod hash;
pub mod log_sanitize;
pub mod nodetasks;
pub mod planner;
pub mod runner;
pub mod target;
pub mod task;
pub mod workspace;

pub use error::{Error, Result};
