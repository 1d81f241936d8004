//! flowprobe CLI - Main Entry Point
//!
//! Loads scenario files, runs them against a session backend and reports
//! per-step outcomes.
//!
//! Exit status: 0 when every scenario passed, 1 when any failed or aborted,
//! 2 when scenarios or configuration could not be loaded.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use flowprobe_engine::EngineConfig;

mod commands;
mod output;

use commands::{list, run, validate};

/// Exit status for load and configuration errors
const EXIT_LOAD_ERROR: i32 = 2;

/// flowprobe - condition-driven UI workflow tests
#[derive(Parser)]
#[command(name = "flowprobe")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Engine configuration file
    #[arg(
        long,
        env = "FLOWPROBE_CONFIG",
        default_value = flowprobe_engine::config::CONFIG_FILE,
        global = true
    )]
    config: PathBuf,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scenarios and write a report
    Run(run::RunArgs),

    /// List scenarios without running them
    List(list::ListArgs),

    /// Load and check scenarios
    Validate(validate::ValidateArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .init();

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            output::print_error(&format!("{e:#}"));
            EXIT_LOAD_ERROR
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let config = EngineConfig::load(&cli.config)?;

    match cli.command {
        Commands::Run(args) => run::execute(args, config, cli.format).await,
        Commands::List(args) => {
            list::execute(args, &config, cli.format)?;
            Ok(0)
        }
        Commands::Validate(args) => {
            validate::execute(args, &config)?;
            Ok(0)
        }
    }
}
