#![cfg_attr(not(test), forbid(unsafe_code))]
#![deny(warnings, clippy::pedantic)]
#![allow(clippy::multiple_crate_versions)]

//! Command line entry point for the ClassChat server.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use shared::config::server::Config;

/// Main CLI structure for the ClassChat server
#[derive(Parser)]
#[command(name = "classchat-server")]
#[command(about = "Read-state tracking and real-time fan-out for ClassChat", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server, the hub bridge and the reconciliation worker
    Serve {
        /// Port to bind, overriding the configuration file (e.g. `--port 8080`)
        #[arg(long, short)]
        port: Option<u16>,

        /// Path to a configuration file (`.toml`, `.yaml`, `.yml` or `.json`)
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Run one reconciliation pass of seen-by sets into read receipts and exit
    Reconcile {
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

/// Initializes environment variables and returns the parsed CLI.
#[must_use]
pub fn initialize_cli() -> Cli {
    dotenv().ok();
    Cli::parse()
}

fn load(config: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<Config> {
    Config::load_config(config, port).context("failed to load configuration")
}

async fn run_app() -> anyhow::Result<()> {
    match initialize_cli().command {
        Commands::Serve { port, config } => {
            server::run(load(config, port)?)
                .await
                .context("server exited with an error")?;
        }
        Commands::Reconcile { config } => {
            let summary = server::run_reconciliation(load(config, None)?)
                .await
                .context("reconciliation pass failed")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run_app().await
}
