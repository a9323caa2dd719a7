// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Mesh commands
//!
//! Commands: status, route, run
//!
//! Each invocation builds a coordinator from the configured topology over the
//! in-memory network, so the commands show how the mesh would place, route
//! and run work without contacting real nodes.

use anyhow::{anyhow, Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use codemesh_core::domain::execution::{ExecutionContext, ExecutionStatus};
use codemesh_core::domain::mesh_config::MeshConfigManifest;
use codemesh_core::domain::node::{NodeId, NodeStatus};
use codemesh_core::infrastructure::{DigestBackend, InMemoryNetwork};
use codemesh_core::MeshCoordinator;

#[derive(Subcommand)]
pub enum MeshCommand {
    /// Show nodes and network health
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Lowest-latency route between two nodes
    Route {
        #[arg(value_name = "FROM")]
        from: String,

        #[arg(value_name = "TO")]
        to: String,
    },

    /// Add a file to the mesh and execute it
    Run {
        /// Source file to replicate and execute
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Node that owns the file
        #[arg(long)]
        primary: String,

        /// Execution context (local, edge, cloud, quantum, hybrid)
        #[arg(long, default_value = "local")]
        context: String,

        /// Requesting node (default: the primary)
        #[arg(long)]
        origin: Option<String>,
    },
}

pub async fn handle_command(command: MeshCommand, config_override: Option<PathBuf>) -> Result<()> {
    let manifest = MeshConfigManifest::load_or_default(config_override).context("Failed to load configuration")?;
    manifest.validate().context("Configuration validation failed")?;
    let mesh = build_coordinator(&manifest)?;

    match command {
        MeshCommand::Status { json } => status(&mesh, json).await,
        MeshCommand::Route { from, to } => route(&mesh, &from, &to),
        MeshCommand::Run {
            file,
            primary,
            context,
            origin,
        } => run(&mesh, &file, &primary, &context, origin.as_deref()).await,
    }
}

pub fn build_coordinator(manifest: &MeshConfigManifest) -> Result<MeshCoordinator> {
    MeshCoordinator::from_config(
        manifest,
        Arc::new(InMemoryNetwork::new()),
        Arc::new(DigestBackend::new()),
    )
    .context("Failed to build mesh from configuration")
}

async fn status(mesh: &MeshCoordinator, json: bool) -> Result<()> {
    let status = mesh.get_mesh_status().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let health = &status.network_health;
    println!("{}", "Mesh status:".bold());
    println!("  Coordinator: {}", status.coordinator_id);
    println!(
        "  Nodes: {} online, {} degraded, {} total ({:.0}% available)",
        health.online_nodes,
        health.degraded_nodes,
        health.total_nodes,
        health.availability * 100.0
    );
    println!(
        "  Links: {} (avg latency {:.1} ms)",
        health.topology_edges, health.avg_latency_ms
    );
    println!();

    println!("{}", "Nodes:".bold());
    for node in &status.nodes {
        let state = match node.status {
            NodeStatus::Online => node.status.as_str().green(),
            NodeStatus::Degraded => node.status.as_str().yellow(),
            NodeStatus::Offline => node.status.as_str().red(),
        };
        println!(
            "  {:<16} {:<16} {:<9} load {:.2}",
            node.id.as_str(),
            node.node_type.as_str(),
            state,
            node.load
        );
    }
    Ok(())
}

fn route(mesh: &MeshCoordinator, from: &str, to: &str) -> Result<()> {
    let route = mesh.shortest_path(&NodeId::from(from), &NodeId::from(to))?;
    let hops: Vec<&str> = route.nodes.iter().map(|n| n.as_str()).collect();
    println!("{} ({} ms, {} hops)", hops.join(" → ").bold(), route.total_latency_ms, route.hops());
    Ok(())
}

async fn run(mesh: &MeshCoordinator, file: &Path, primary: &str, context: &str, origin: Option<&str>) -> Result<()> {
    let context: ExecutionContext = context.parse().map_err(|e: String| anyhow!(e))?;
    let content = std::fs::read(file).with_context(|| format!("Failed to read {:?}", file))?;
    let primary = NodeId::from(primary);
    let origin = origin.map(NodeId::from).unwrap_or_else(|| primary.clone());

    let path = file.to_string_lossy();
    let artifact_id = mesh.add_file(&path, content, &primary).await?;
    let result = mesh.execute_code(&artifact_id, context, &origin).await?;

    if result.status != ExecutionStatus::Completed {
        eprintln!("{}", format!("Execution {}", result.status.as_str()).yellow());
    }
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
