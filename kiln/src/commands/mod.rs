//! Kiln command-line interface
//!
//! - `unity`: group a module's sources into unity files
//! - `run`: execute the outdated part of an action list
//! - `cache`: inspect cache files

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod cache;
pub mod run;
pub mod unity;

pub type CommandResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Kiln - unity builds and parallel action execution for C++ targets
#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "Unity builds and parallel action execution for C++ targets")]
#[command(version)]
pub struct Cli {
    /// Build configuration (YAML); defaults apply when it does not exist
    #[arg(short, long, global = true, default_value = "kiln.yml")]
    pub config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Plan and write the unity files of a module
    Unity {
        /// Module name used in unit file names
        #[arg(short, long)]
        module: String,

        /// Directory searched for .cpp files
        #[arg(short, long)]
        source_dir: PathBuf,

        /// Directory receiving the unity files
        #[arg(short, long)]
        output_dir: PathBuf,
    },

    /// Run the outdated actions of an action list
    Run {
        /// JSON action list
        #[arg(short, long)]
        actions: PathBuf,
    },

    /// Cache file operations
    Cache {
        #[command(subcommand)]
        operation: CacheOperation,
    },
}

#[derive(Subcommand)]
pub enum CacheOperation {
    /// Show signature, entry count and lock state of a cache file
    Info {
        /// Cache file
        path: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from(["kiln", "run", "--actions", "a.json", "-v"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.config, PathBuf::from("kiln.yml"));
        assert!(matches!(cli.command, Commands::Run { .. }));
    }

    #[test]
    fn repeated_flags_are_rejected() {
        let parsed = Cli::try_parse_from([
            "kiln", "run", "--actions", "a.json", "--actions", "b.json",
        ]);
        assert!(parsed.is_err());
    }
}
