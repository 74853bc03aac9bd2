//! Task model and execution.

pub mod direction;
pub mod executor;
pub mod spec;
