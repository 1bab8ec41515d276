//! helix-cli library exports
//!
//! Argument parsing and command implementations for the `helix-pool` binary.

pub mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use helix_config::{ConfigLoader, HelixConfig};
use std::path::PathBuf;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "HELIX";

#[derive(Parser)]
#[command(name = "helix-pool")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Drive the pool with simulated inference jobs and print a summary
    Run {
        /// Number of jobs to submit
        #[arg(short, long, default_value = "20")]
        jobs: usize,
        /// Models to cycle through (repeatable)
        #[arg(short, long = "model", default_value = "llama-7b")]
        models: Vec<String>,
        /// Skip simulated load and inference delays
        #[arg(long)]
        fast: bool,
        /// Print collected metrics in Prometheus text format
        #[arg(long)]
        metrics: bool,
    },
    /// Show the device inventory and effective model footprints
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate a configuration
    CheckConfig {
        /// Emit additional sizing warnings
        #[arg(long)]
        strict: bool,
    },
}

/// Loads defaults, the optional file and `HELIX_*` overrides
pub fn load_config(path: Option<&PathBuf>) -> Result<HelixConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = path {
        loader = loader.with_file(path);
    }
    loader
        .with_env_prefix(ENV_PREFIX)
        .load()
        .context("failed to load configuration")
}

/// Formats a byte count in GiB
#[must_use]
pub fn gib(bytes: u64) -> String {
    format!("{:.1} GiB", bytes as f64 / helix_pool::GIB as f64)
}
