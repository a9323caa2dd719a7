// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # CodeMesh CLI
//!
//! The `codemesh` binary loads a mesh topology from configuration and
//! drives the coordinator against it.
//!
//! ## Commands
//!
//! - `codemesh config show|validate|generate` - Configuration management
//! - `codemesh mesh status|route|run` - Inspect and exercise the mesh

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};

use codemesh_cli::commands::{self, ConfigCommand, MeshCommand};
use codemesh_core::domain::mesh_config::MeshConfigManifest;

/// CodeMesh - distributed code-mesh coordinator
#[derive(Parser)]
#[command(name = "codemesh")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "CODEMESH_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "CODEMESH_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Mesh inspection and execution
    #[command(name = "mesh")]
    Mesh {
        #[command(subcommand)]
        command: MeshCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Observability settings come from the config file when one is readable.
    let observability = MeshConfigManifest::load_or_default(cli.config.clone())
        .ok()
        .and_then(|m| m.spec.observability)
        .unwrap_or_default();
    let format = observability
        .logging
        .as_ref()
        .map(|l| l.format.as_str())
        .unwrap_or("text");

    init_logging(&cli.log_level, format)?;

    if let Some(metrics) = observability.metrics.as_ref().filter(|m| m.enabled) {
        init_metrics(metrics.port)?;
    }

    match cli.command {
        Some(Commands::Config { command }) => commands::config::handle_command(command, cli.config).await,
        Some(Commands::Mesh { command }) => commands::mesh::handle_command(command, cli.config).await,
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    if format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }

    Ok(())
}

/// Expose `metrics` counters on a Prometheus scrape endpoint.
fn init_metrics(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => info!(%addr, "Prometheus exporter listening"),
        Err(e) => warn!(error = %e, "Failed to start Prometheus exporter"),
    }
    Ok(())
}
