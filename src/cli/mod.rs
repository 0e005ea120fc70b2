//! Command-line interface for eval-forge.
//!
//! Provides commands for migrations, single scheduler ticks, the long-running
//! scheduler loop and policy inspection.

mod commands;

pub use commands::{build_context, parse_cli, run, run_with_cli, Cli, Commands};
