//! Kiln - unity builds and parallel action execution for C++ targets
//!
//! Orchestrates:
//! 1. Configuration loading (`kiln.yml`)
//! 2. Unity file generation for a module
//! 3. Outdated action detection and execution on the selected backend
//! 4. Cache inspection

use clap::Parser;
use kiln_build::{BuildConfiguration, BuildSession, SystemHost};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{CacheOperation, Cli, CommandResult, Commands};

const DEFAULT_FILTER: &str = "kiln=info,kiln_build=info,kiln_cache=info";
const VERBOSE_FILTER: &str = "kiln=debug,kiln_build=debug,kiln_cache=debug";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new(VERBOSE_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the command succeeded.
async fn run(cli: Cli) -> CommandResult<bool> {
    let config = BuildConfiguration::load_or_default(&cli.config)?;
    let session = BuildSession::new(config, Arc::new(SystemHost));

    match cli.command {
        Commands::Unity {
            module,
            source_dir,
            output_dir,
        } => {
            commands::unity::execute(&session, &module, &source_dir, &output_dir)?;
            Ok(true)
        }
        Commands::Run { actions } => {
            let report = commands::run::execute(session, &actions).await?;
            Ok(report.success())
        }
        Commands::Cache { operation } => match operation {
            CacheOperation::Info { path } => {
                commands::cache::info(&path)?;
                Ok(true)
            }
        },
    }
}
