//! Pipe protocol layer: line channel and command parsing.

pub mod channel;
pub mod command;
