//! Command-line interface.

pub mod commands;

pub use commands::{init_tracing, run_with_cli, Cli, Commands};
