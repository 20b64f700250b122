// ABOUTME: Entry point for the conveyor CLI application.
// ABOUTME: Parses arguments and dispatches to appropriate command handlers.

mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, TestResult};
use conveyor::config::{self, Config};
use conveyor::error::Result;
use conveyor::output::Output;
use std::env;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise debug when verbose, warn by default
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let result = run(cli).await;

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::load(path),
        None => Config::discover(&env::current_dir()?),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let output = Output::new(cli.output.into());

    match &cli.command {
        Commands::Init {
            workload,
            repository,
            force,
        } => {
            let cwd = env::current_dir()?;
            config::init_config(&cwd, workload.as_deref(), repository.as_deref(), *force)?;
            output.success(&format!("Created {}", config::CONFIG_FILENAME));
            Ok(())
        }
        Commands::Push {
            workload,
            commit,
            branch,
            tests,
        } => {
            let config = load_config(&cli)?;
            let tests_passed = tests.map(|t| t == TestResult::Passed);
            commands::push(config, workload, commit, branch, tests_passed, output).await
        }
        Commands::Plan {
            workload,
            commit,
            branch,
        } => {
            let config = load_config(&cli)?;
            commands::plan(config, workload, commit, branch, output).await
        }
        Commands::Status { run } => commands::status(load_config(&cli)?, run, output).await,
        Commands::Runs { workload, rejected } => {
            commands::runs(load_config(&cli)?, workload.as_deref(), *rejected, output).await
        }
        Commands::Abort { run } => commands::abort(load_config(&cli)?, run, output).await,
        Commands::Resume => commands::resume(load_config(&cli)?, output).await,
    }
}
