// ABOUTME: Command-line interface definition using clap derive macros.
// ABOUTME: Defines all subcommands and their arguments.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use conveyor::output::OutputMode;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(about = "Continuous deployment: resolve, roll out, verify, promote or roll back")]
#[command(version)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Normal)]
    pub output: OutputFormat,

    /// Path to the configuration file (discovered from the working directory by default)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Normal,
    Quiet,
    Json,
}

impl From<OutputFormat> for OutputMode {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Normal => OutputMode::Normal,
            OutputFormat::Quiet => OutputMode::Quiet,
            OutputFormat::Json => OutputMode::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TestResult {
    Passed,
    Failed,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a new conveyor.yml configuration file
    Init {
        /// Workload id for the generated config
        #[arg(short, long)]
        workload: Option<String>,

        /// Artifact repository for the generated config
        #[arg(short, long)]
        repository: Option<String>,

        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Deploy a pushed revision of a workload
    Push {
        /// Workload to deploy
        workload: String,

        /// Commit hash of the pushed revision
        #[arg(long)]
        commit: String,

        /// Branch the revision was pushed to
        #[arg(long, default_value = "main")]
        branch: String,

        /// Result of the pipeline's test stage
        #[arg(long, value_enum)]
        tests: Option<TestResult>,
    },

    /// Show the rollout plan for a revision without deploying it
    Plan {
        workload: String,

        #[arg(long)]
        commit: String,

        #[arg(long, default_value = "main")]
        branch: String,
    },

    /// Show the state of one run
    Status {
        /// Run id
        run: String,
    },

    /// List runs, newest last
    Runs {
        /// Only show runs of this workload
        #[arg(short, long)]
        workload: Option<String>,

        /// List rejected pushes instead
        #[arg(long)]
        rejected: bool,
    },

    /// Ask a running deployment to stop and roll back
    Abort {
        /// Run id
        run: String,
    },

    /// Resume runs interrupted by a restart
    Resume,
}
