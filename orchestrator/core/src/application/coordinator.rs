// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Mesh Coordinator
//!
//! Single entry point over the mesh. Composes the [`TopologyRegistry`],
//! [`GuardianSystem`], [`ReplicationManager`] and [`ExecutionRouter`] and
//! reacts to node lifecycle changes across all of them:
//!
//! - a node going offline degrades its guardians
//! - a node coming back recovers its guardians and catches up its replicas
//! - a decommissioned node retires its guardians; primaries are promoted
//!   from the nearest secondary and the artifact's primary node follows

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::guardians::GuardianSystem;
use crate::application::replication::{ReplicationManager, ReplicationStatus, SyncOutcome, SyncStats};
use crate::application::router::ExecutionRouter;
use crate::domain::artifact::{ArtifactId, ConflictRecord, SyncState};
use crate::domain::error::{MeshError, MeshResult};
use crate::domain::events::TopologyEvent;
use crate::domain::execution::{ExecutionContext, ExecutionRecord, ExecutionResult, ExecutionStats};
use crate::domain::guardian::{GuardianId, GuardianState};
use crate::domain::mesh_config::{MeshConfigManifest, MeshSettings};
use crate::domain::node::{NodeId, NodeProbe, NodeSpec, NodeStatus, NodeType};
use crate::domain::runtime::{ExecutionBackend, HealthProbe, ReplicaTransport};
use crate::domain::topology::{NetworkHealth, Route, StatusChange, TopologyRegistry};
use crate::infrastructure::backend::DigestBackend;
use crate::infrastructure::event_bus::{EventBus, EventReceiver};
use crate::infrastructure::transport::InMemoryNetwork;

/// Guardian view of one artifact.
#[derive(Debug, Clone, Serialize)]
pub struct FileMonitor {
    pub artifact_id: ArtifactId,
    pub guardian_id: Option<GuardianId>,
    pub guardian_status: Option<GuardianState>,
    pub sync_state: SyncState,
    pub replicas_consistent: bool,
    pub replica_count: usize,
    pub version: u64,
    pub last_updated: DateTime<Utc>,
    pub changes_detected: u64,
    pub access_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub id: NodeId,
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub load: f64,
    pub hosted_files: usize,
    pub agents: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeshStatus {
    pub coordinator_id: Uuid,
    pub network_health: NetworkHealth,
    pub total_files: usize,
    pub total_agents: usize,
    pub sync_events: usize,
    pub executions: u64,
    pub nodes: Vec<NodeSummary>,
}

pub struct MeshCoordinator {
    id: Uuid,
    topology: Arc<TopologyRegistry>,
    guardians: Arc<GuardianSystem>,
    replication: Arc<ReplicationManager>,
    router: ExecutionRouter,
    event_bus: EventBus,
}

impl MeshCoordinator {
    pub fn new(
        settings: MeshSettings,
        transport: Arc<dyn ReplicaTransport>,
        backend: Arc<dyn ExecutionBackend>,
    ) -> Self {
        let event_bus = EventBus::with_default_capacity();
        let topology = Arc::new(TopologyRegistry::new(settings.max_load, settings.degraded_load));
        let guardians = Arc::new(GuardianSystem::new(topology.clone(), event_bus.clone()));
        let replication = Arc::new(ReplicationManager::new(
            topology.clone(),
            guardians.clone(),
            transport,
            event_bus.clone(),
            &settings,
        ));
        let router = ExecutionRouter::new(topology.clone(), replication.clone(), backend, event_bus.clone(), &settings);

        let id = Uuid::new_v4();
        info!(coordinator_id = %id, replication_factor = settings.replication_factor, "Mesh coordinator initialized");
        Self {
            id,
            topology,
            guardians,
            replication,
            router,
            event_bus,
        }
    }

    /// Coordinator over an in-memory network with the digest backend.
    pub fn in_memory(settings: MeshSettings) -> Self {
        Self::new(settings, Arc::new(InMemoryNetwork::new()), Arc::new(DigestBackend::new()))
    }

    /// Build a coordinator and load the declared topology from a manifest.
    pub fn from_config(
        manifest: &MeshConfigManifest,
        transport: Arc<dyn ReplicaTransport>,
        backend: Arc<dyn ExecutionBackend>,
    ) -> MeshResult<Self> {
        let coordinator = Self::new(manifest.spec.settings(), transport, backend);
        coordinator.initialize_mesh(manifest.spec.nodes.clone())?;
        for connection in &manifest.spec.connections {
            coordinator.connect_nodes(
                &connection.a,
                &connection.b,
                connection.latency_ms,
                connection.bandwidth_mbps,
            )?;
        }
        Ok(coordinator)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topology(&self) -> &TopologyRegistry {
        &self.topology
    }

    // ========================================================================
    // Topology
    // ========================================================================

    pub fn initialize_mesh(&self, specs: Vec<NodeSpec>) -> MeshResult<Vec<NodeId>> {
        let mut registered = Vec::with_capacity(specs.len());
        for spec in specs {
            let node = self.topology.register_node(spec)?;
            self.event_bus.publish_topology_event(TopologyEvent::NodeRegistered {
                node_id: node.id.clone(),
                node_type: node.node_type,
                registered_at: node.registered_at,
            });
            registered.push(node.id);
        }
        info!(nodes = registered.len(), "Mesh initialized");
        Ok(registered)
    }

    pub fn connect_nodes(&self, a: &NodeId, b: &NodeId, latency_ms: u64, bandwidth_mbps: u32) -> MeshResult<()> {
        self.topology.connect(a, b, latency_ms, bandwidth_mbps)?;
        self.event_bus.publish_topology_event(TopologyEvent::NodesConnected {
            a: a.clone(),
            b: b.clone(),
            latency_ms,
        });
        Ok(())
    }

    pub fn shortest_path(&self, from: &NodeId, to: &NodeId) -> MeshResult<Route> {
        self.topology.shortest_path(from, to)
    }

    // ========================================================================
    // Files
    // ========================================================================

    pub async fn add_file(&self, path: &str, content: impl Into<Bytes>, primary: &NodeId) -> MeshResult<ArtifactId> {
        self.replication.add_artifact(path, content.into(), primary).await
    }

    /// `true` when the write was applied or changed nothing, `false` when it
    /// was recorded as divergent.
    pub async fn sync_file(&self, artifact_id: &ArtifactId, content: impl Into<Bytes>, origin: &NodeId) -> MeshResult<bool> {
        let outcome = self.replication.sync(artifact_id, content.into(), origin).await?;
        Ok(outcome != SyncOutcome::Conflicted)
    }

    pub async fn execute_code(
        &self,
        artifact_id: &ArtifactId,
        context: ExecutionContext,
        origin: &NodeId,
    ) -> MeshResult<ExecutionResult> {
        self.router.route(artifact_id, context, origin).await
    }

    pub async fn get_replication_status(&self, artifact_id: &ArtifactId) -> MeshResult<ReplicationStatus> {
        self.replication.status(artifact_id).await
    }

    pub async fn monitor_file(&self, artifact_id: &ArtifactId) -> MeshResult<FileMonitor> {
        let status = self.replication.status(artifact_id).await?;
        let artifact = self.replication.snapshot(artifact_id).await?;
        let report = self.guardians.report(artifact_id);

        Ok(FileMonitor {
            artifact_id: *artifact_id,
            guardian_id: report.primary.as_ref().map(|g| g.id),
            guardian_status: report.primary.as_ref().map(|g| g.state),
            sync_state: status.sync_state,
            replicas_consistent: status.consistent,
            replica_count: status.replicas.len(),
            version: status.version,
            last_updated: artifact.updated_at,
            changes_detected: report.changes_detected,
            access_count: artifact.access_log().len(),
        })
    }

    pub async fn resolve_conflict(&self, artifact_id: &ArtifactId, winner: &NodeId) -> MeshResult<bool> {
        self.replication.resolve_conflict(artifact_id, winner).await
    }

    pub async fn detect_conflict(&self, artifact_id: &ArtifactId) -> MeshResult<Option<ConflictRecord>> {
        self.replication.detect_conflict(artifact_id).await
    }

    /// Report an edit made directly on a node. Returns whether it diverged.
    pub async fn record_local_edit(
        &self,
        artifact_id: &ArtifactId,
        node_id: &NodeId,
        content: impl Into<Bytes>,
    ) -> MeshResult<bool> {
        self.replication.record_local_edit(artifact_id, node_id, content.into()).await
    }

    pub async fn remove_file(&self, artifact_id: &ArtifactId) -> MeshResult<()> {
        self.replication.remove_artifact(artifact_id).await
    }

    /// Current content of the file at `path`, logged as a read by `reader`.
    pub async fn open_file(&self, path: &str, reader: &NodeId) -> MeshResult<Bytes> {
        let artifact_id = self.replication.find_by_path(path)?;
        self.replication.read_content(&artifact_id, reader).await
    }

    pub async fn save_file(&self, path: &str, content: impl Into<Bytes>, origin: &NodeId) -> MeshResult<bool> {
        let artifact_id = self.replication.find_by_path(path)?;
        self.sync_file(&artifact_id, content, origin).await
    }

    pub fn get_file(&self, path: &str) -> MeshResult<ArtifactId> {
        self.replication.find_by_path(path)
    }

    // ========================================================================
    // Node lifecycle
    // ========================================================================

    pub async fn mark_unavailable(&self, node_id: &NodeId) -> MeshResult<()> {
        let change = self.topology.mark_unavailable(node_id)?;
        self.react_to(node_id, change).await;
        Ok(())
    }

    pub async fn mark_available(&self, node_id: &NodeId) -> MeshResult<()> {
        let change = self.topology.mark_available(node_id)?;
        self.react_to(node_id, change).await;
        Ok(())
    }

    pub async fn apply_probe(&self, node_id: &NodeId, probe: NodeProbe) -> MeshResult<Option<StatusChange>> {
        let change = self.topology.apply_probe(node_id, probe)?;
        self.react_to(node_id, change).await;
        Ok(change)
    }

    /// Probe every live node concurrently. Returns the number of status changes.
    pub async fn run_health_probes(&self, probe: &dyn HealthProbe) -> usize {
        let nodes: Vec<_> = self.topology.list().into_iter().filter(|n| !n.decommissioned).collect();
        let probes = join_all(nodes.iter().map(|node| probe.probe(node))).await;

        let mut changes = 0;
        for (node, result) in nodes.iter().zip(probes) {
            let observed = result.unwrap_or_else(|e| {
                warn!(node = %node.id, error = %e, "Health probe failed");
                NodeProbe::unreachable()
            });
            match self.apply_probe(&node.id, observed).await {
                Ok(Some(_)) => changes += 1,
                Ok(None) => {}
                Err(e) => warn!(node = %node.id, error = %e, "Could not apply probe"),
            }
        }
        debug!(probed = nodes.len(), changes, "Health probes complete");
        changes
    }

    async fn react_to(&self, node_id: &NodeId, change: Option<StatusChange>) {
        let Some(change) = change else {
            return;
        };
        self.event_bus.publish_topology_event(TopologyEvent::NodeStatusChanged {
            node_id: node_id.clone(),
            from: change.from,
            to: change.to,
            changed_at: Utc::now(),
        });

        match (change.from.is_reachable(), change.to.is_reachable()) {
            (true, false) => {
                let degraded = self.guardians.on_node_unavailable(node_id);
                warn!(node = %node_id, guardians = degraded.len(), "Node became unreachable");
            }
            (false, true) => {
                let recovered = self.guardians.on_node_available(node_id);
                let pushes = self.replication.catch_up(node_id).await;
                info!(node = %node_id, guardians = recovered.len(), pushes, "Node reachable again");
            }
            _ => debug!(node = %node_id, from = %change.from, to = %change.to, "Node status changed"),
        }
    }

    /// Soft-remove a node. Primary guardians on it are replaced by the nearest
    /// live secondary and the artifact's primary node moves with it.
    pub async fn decommission_node(&self, node_id: &NodeId) -> MeshResult<Vec<GuardianId>> {
        self.topology.decommission(node_id)?;
        self.event_bus.publish_topology_event(TopologyEvent::NodeDecommissioned {
            node_id: node_id.clone(),
            decommissioned_at: Utc::now(),
        });

        let mut promoted = Vec::new();
        for retirement in self.guardians.retire_on_node(node_id) {
            if !retirement.was_primary {
                continue;
            }
            let artifact_id = retirement.artifact_id;
            let anchor = match self.replication.snapshot(&artifact_id).await {
                Ok(artifact) => artifact
                    .replicas()
                    .iter()
                    .filter(|r| &r.node_id != node_id && artifact.is_replica_consistent(r))
                    .max_by_key(|r| r.updated_at)
                    .map(|r| r.node_id.clone())
                    .unwrap_or_else(|| artifact.latest_sync_node().clone()),
                Err(MeshError::ArtifactNotFound(_)) => continue,
                Err(e) => return Err(e),
            };

            match self.guardians.promote(&artifact_id, &anchor) {
                Ok(guardian_id) => {
                    let new_primary = self.guardians.get(&guardian_id)?.node_id;
                    self.replication.reassign_primary(&artifact_id, &new_primary).await?;
                    promoted.push(guardian_id);
                }
                Err(MeshError::NoSecondaryGuardian(_)) => {
                    warn!(%artifact_id, node = %node_id, "No secondary guardian left to promote");
                }
                Err(e) => return Err(e),
            }
        }

        info!(node = %node_id, promoted = promoted.len(), "Node decommissioned");
        Ok(promoted)
    }

    // ========================================================================
    // Status & telemetry
    // ========================================================================

    pub async fn get_mesh_status(&self) -> MeshStatus {
        let nodes = self
            .topology
            .list()
            .into_iter()
            .map(|node| NodeSummary {
                hosted_files: node.hosted_artifacts.len(),
                agents: node.guardians.len(),
                id: node.id,
                node_type: node.node_type,
                status: node.status,
                load: node.load,
            })
            .collect();

        MeshStatus {
            coordinator_id: self.id,
            network_health: self.topology.health(),
            total_files: self.replication.count(),
            total_agents: self.guardians.count(),
            sync_events: self.replication.sync_events().len(),
            executions: self.router.total_executions(),
            nodes,
        }
    }

    pub fn execution_history(&self, artifact_id: &ArtifactId) -> Vec<ExecutionRecord> {
        self.router.history(artifact_id)
    }

    pub fn execution_stats(&self) -> ExecutionStats {
        self.router.stats()
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.replication.sync_stats()
    }

    pub fn guardians(&self) -> &GuardianSystem {
        &self.guardians
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Wait for in-flight replica pushes.
    pub async fn settle(&self) {
        self.replication.settle().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> MeshCoordinator {
        let mesh = MeshCoordinator::in_memory(MeshSettings {
            replication_factor: 2,
            push_retry_delay_ms: 1,
            ..MeshSettings::default()
        });
        mesh.initialize_mesh(vec![
            NodeSpec::new("a", NodeType::Local),
            NodeSpec::new("b", NodeType::Edge),
            NodeSpec::new("c", NodeType::Cloud),
        ])
        .unwrap();
        mesh.connect_nodes(&"a".into(), &"b".into(), 20, 100).unwrap();
        mesh.connect_nodes(&"b".into(), &"c".into(), 80, 100).unwrap();
        mesh
    }

    #[tokio::test]
    async fn test_monitor_file_counts_reads() {
        let mesh = coordinator();
        let id = mesh.add_file("lib.rs", "fn main() {}", &"a".into()).await.unwrap();
        mesh.open_file("lib.rs", &"b".into()).await.unwrap();

        let monitor = mesh.monitor_file(&id).await.unwrap();
        assert_eq!(monitor.access_count, 1);
        assert_eq!(monitor.replica_count, 2);
        assert_eq!(monitor.guardian_status, Some(GuardianState::Active));
        assert_eq!(monitor.sync_state, SyncState::Synced);
    }

    #[tokio::test]
    async fn test_mark_unavailable_degrades_guardians() {
        let mesh = coordinator();
        let id = mesh.add_file("lib.rs", "fn main() {}", &"a".into()).await.unwrap();

        mesh.mark_unavailable(&"a".into()).await.unwrap();
        assert_eq!(
            mesh.monitor_file(&id).await.unwrap().guardian_status,
            Some(GuardianState::Degraded)
        );

        mesh.mark_available(&"a".into()).await.unwrap();
        assert_eq!(
            mesh.monitor_file(&id).await.unwrap().guardian_status,
            Some(GuardianState::Active)
        );
    }

    #[tokio::test]
    async fn test_mesh_status_summarizes_nodes() {
        let mesh = coordinator();
        mesh.add_file("lib.rs", "fn main() {}", &"a".into()).await.unwrap();

        let status = mesh.get_mesh_status().await;
        assert_eq!(status.total_files, 1);
        assert_eq!(status.total_agents, 2);
        assert_eq!(status.nodes.len(), 3);
        let a = status.nodes.iter().find(|n| n.id.as_str() == "a").unwrap();
        assert_eq!(a.hosted_files, 1);
        assert_eq!(a.agents, 1);
    }
}
