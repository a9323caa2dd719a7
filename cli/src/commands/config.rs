// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use codemesh_core::domain::mesh_config::MeshConfigManifest;

const TEMPLATE: &str = include_str!("../../templates/codemesh-config.yaml");

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./codemesh.yaml)
        #[arg(short, long, default_value = "./codemesh.yaml")]
        output: PathBuf,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output } => generate(&output).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = MeshConfigManifest::load_or_default(config_override.clone()).context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. CODEMESH_CONFIG_PATH: {}",
            std::env::var("CODEMESH_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./codemesh.yaml");
        println!("  4. ~/.codemesh/config.yaml");
        println!("  5. /etc/codemesh/config.yaml");
        println!();
    }

    println!("{}", "Current configuration:".bold());
    println!("  Name: {}", config.metadata.name);
    println!();

    let settings = config.spec.settings();
    println!("{}", "Replication:".bold());
    println!("  Factor: {}", settings.replication_factor);
    println!(
        "  Push retries: {} (base delay {} ms)",
        settings.push_retries, settings.push_retry_delay_ms
    );
    println!();

    println!("{}", "Execution:".bold());
    println!("  Timeout: {} ms", settings.execution_timeout_ms);
    println!("  Hybrid deadline: {} ms", settings.hybrid_deadline_ms);
    println!("  Max load: {:.2}", settings.max_load);
    println!("  Degraded at load: {:.2}", settings.degraded_load);
    println!();

    println!("{}", format!("Nodes ({}):", config.spec.nodes.len()).bold());
    for node in &config.spec.nodes {
        println!("  {} ({}) @ {}", node.id.as_str().bold(), node.node_type, node.location);
    }
    println!();

    println!("{}", format!("Connections ({}):", config.spec.connections.len()).bold());
    for connection in &config.spec.connections {
        println!(
            "  {} ↔ {}  {} ms, {} Mbps",
            connection.a, connection.b, connection.latency_ms, connection.bandwidth_mbps
        );
    }

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = MeshConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: &Path) -> Result<()> {
    std::fs::write(output, TEMPLATE).with_context(|| format!("Failed to write config to {:?}", output))?;

    println!("{}", format!("✓ Configuration generated: {}", output.display()).green());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_is_valid() {
        let manifest = MeshConfigManifest::from_yaml_str(TEMPLATE).unwrap();
        manifest.validate().unwrap();
        assert!(!manifest.spec.nodes.is_empty());
    }

    #[tokio::test]
    async fn test_generate_writes_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("codemesh.yaml");

        generate(&path).await.unwrap();
        let written = MeshConfigManifest::from_yaml_file(&path).unwrap();
        assert_eq!(written.metadata.name, "codemesh-lab");
    }
}
