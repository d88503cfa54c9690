//! CLI command definitions for task-dispatch.
//!
//! The `Cli` struct holds global flags and the subcommand; `run` holds the
//! start-up sequence shared by `start` and `retry`.

pub mod run;

use crate::format::OutputFormat;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Distributed task dispatcher
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<PathBuf>,

    /// Directory for PID and stop files (overrides config)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Options for commands that run the scheduler.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Project name
    pub project: String,

    /// Spec directory (default: from config, or specs/<project>)
    #[arg(long, value_name = "DIR")]
    pub specs: Option<PathBuf>,

    /// Stop after this many cycles
    #[arg(long, value_name = "N")]
    pub max_cycles: Option<u64>,

    /// Print the final summary as text or json
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scan specs and run the scheduler until the project finishes
    Start(RunArgs),

    /// Show task counts per project
    Status {
        /// Limit to one project
        project: Option<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Ask a running scheduler to stop after its current cycle
    Stop { project: String },

    /// Reset failed tasks to a fresh attempt budget, then start
    Retry(RunArgs),

    /// Import specs without scheduling
    Scan {
        project: String,
        #[arg(long, value_name = "DIR")]
        specs: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Cancel one task
    Kill { task_id: String },

    /// Summary of a project: counts, failures, blocked tasks, breaker
    Report {
        project: String,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// List registered nodes
    Nodes {
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Enable or disable a node
    Node {
        #[command(subcommand)]
        action: NodeAction,
    },

    /// Tail of a project's audit log
    Events {
        project: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },
}

#[derive(Subcommand, Debug)]
pub enum NodeAction {
    Enable { name: String },
    Disable { name: String },
}

impl Command {
    /// Output format the command was asked for, used for error output too.
    pub fn format(&self) -> OutputFormat {
        match self {
            Command::Start(args) | Command::Retry(args) => args.format,
            Command::Status { format, .. }
            | Command::Scan { format, .. }
            | Command::Report { format, .. }
            | Command::Nodes { format }
            | Command::Events { format, .. } => *format,
            Command::Stop { .. } | Command::Kill { .. } | Command::Node { .. } => OutputFormat::Text,
        }
    }
}
