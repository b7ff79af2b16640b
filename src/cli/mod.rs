//! Command-line interface for tern-forge.
//!
//! Provides commands for generation, retrying failures, run status,
//! label encoding and dataset export.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, RunArgs};
