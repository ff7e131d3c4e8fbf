//! Command line interface module
//!
//! Argument parsing and the runner that drives one pipeline run per
//! invocation.

pub mod args;
pub mod runner;

pub use args::{Cli, Commands, InvokeArgs, MoveArgs};
pub use runner::Runner;
