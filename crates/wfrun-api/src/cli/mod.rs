//! CLI command definitions for the `wfrun` binary.
//!
//! Uses clap derive macros for argument parsing. Runs are addressed by name
//! or UUID everywhere a `<RUN>` argument is taken.

pub mod config;
pub mod render;
pub mod run;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Drive durable, tick-based workflow runs.
#[derive(Parser)]
#[command(name = "wfrun", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "WFRUN_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a run or store a workflow from a YAML manifest.
    Apply {
        /// Path to a `WorkflowRun` or `Workflow` manifest.
        file: PathBuf,
    },

    /// List workflow runs, newest first.
    #[command(alias = "ls")]
    List,

    /// Show a run with its step statuses.
    Show {
        /// Run name or UUID.
        run: String,
    },

    /// Advance a run by a single tick.
    Tick {
        /// Run name or UUID.
        run: String,
    },

    /// Tick a run until it finishes, suspends or stops making progress.
    Run {
        /// Run name or UUID.
        run: String,

        /// Tick budget (defaults to `max_ticks` from config.toml).
        #[arg(long)]
        max_ticks: Option<u32>,
    },

    /// Stop admitting new steps of a run.
    Suspend {
        /// Run name or UUID.
        run: String,
    },

    /// Resume a suspended run.
    Resume {
        /// Run name or UUID.
        run: String,
    },

    /// Terminate a run. Unfinished steps are marked stopped.
    Terminate {
        /// Run name or UUID.
        run: String,
    },

    /// Reset a run to a fresh status and clear its context.
    Restart {
        /// Run name or UUID.
        run: String,
    },

    /// Delete a run and its context.
    #[command(alias = "rm")]
    Delete {
        /// Run name or UUID.
        run: String,
    },

    /// Manage stored workflows referenced by `workflowRef`.
    Workflows {
        #[command(subcommand)]
        action: Option<workflow::WorkflowCommand>,
    },

    /// Show the data directory and effective engine configuration.
    Config,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
