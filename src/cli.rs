//! CLI argument parsing using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// `ralph` - autonomous coding-agent loop
///
/// Repeatedly runs a coding agent against `PROMPT.md`, one task from
/// `TASKS.md` per iteration, until the tasks are done, progress stalls, or the
/// iteration budget runs out. Configuration comes from `RALPH_*` environment
/// variables.
#[derive(Parser, Debug)]
#[command(name = "ralph", version, about, long_about = None)]
pub struct Args {
    /// Project directory (defaults to the current directory)
    #[arg(short = 'C', long = "dir", global = true)]
    pub dir: Option<PathBuf>,

    /// Log debug details to stderr (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the loop (default)
    Run {
        /// Iteration budget (overrides RALPH_MAX_ITERATIONS)
        #[arg(value_parser = clap::value_parser!(u32).range(1..))]
        iterations: Option<u32>,
    },
    /// Show task progress
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the next pending task without running anything
    DryRun,
    /// Run a single iteration prompt without the loop
    Once,
}

impl Args {
    /// Returns the subcommand, defaulting to `run` with the configured budget.
    #[must_use]
    pub fn command(&self) -> Command {
        self.command
            .clone()
            .unwrap_or(Command::Run { iterations: None })
    }
}
