// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end tests for the mesh coordinator.
//!
//! Every test builds a small mesh over the in-memory network:
//!
//! ```text
//!   A (local) --20ms-- B (edge) --80ms-- C (cloud)
//!    \________________150ms_____________/
//! ```
//!
//! and drives it through the public `MeshCoordinator` API.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use codemesh_core::application::MeshCoordinator;
use codemesh_core::domain::artifact::{ConflictReason, ReplicaStatus, SyncState};
use codemesh_core::domain::error::MeshError;
use codemesh_core::domain::execution::{ExecutionContext, ExecutionStatus};
use codemesh_core::domain::mesh_config::{MeshConfigManifest, MeshSettings};
use codemesh_core::domain::node::{MeshNode, NodeId, NodeSpec, NodeStatus, NodeType};
use codemesh_core::domain::runtime::{BackendError, ExecutionBackend};
use codemesh_core::infrastructure::{DigestBackend, InMemoryNetwork};

const SOURCE: &str = "def main():\n    return 42\n";

fn settings(factor: usize) -> MeshSettings {
    MeshSettings {
        replication_factor: factor,
        push_retries: 1,
        push_retry_delay_ms: 1,
        ..MeshSettings::default()
    }
}

fn node(id: &str) -> NodeId {
    NodeId::from(id)
}

fn build_mesh(settings: MeshSettings, backend: Arc<dyn ExecutionBackend>) -> (MeshCoordinator, Arc<InMemoryNetwork>) {
    build_mesh_over(settings, Arc::new(InMemoryNetwork::new()), backend)
}

fn build_mesh_over(
    settings: MeshSettings,
    network: Arc<InMemoryNetwork>,
    backend: Arc<dyn ExecutionBackend>,
) -> (MeshCoordinator, Arc<InMemoryNetwork>) {
    let mesh = MeshCoordinator::new(settings, network.clone(), backend);
    mesh.initialize_mesh(vec![
        NodeSpec::new("A", NodeType::Local),
        NodeSpec::new("B", NodeType::Edge),
        NodeSpec::new("C", NodeType::Cloud),
    ])
    .unwrap();
    mesh.connect_nodes(&node("A"), &node("B"), 20, 100).unwrap();
    mesh.connect_nodes(&node("B"), &node("C"), 80, 100).unwrap();
    mesh.connect_nodes(&node("A"), &node("C"), 150, 100).unwrap();
    (mesh, network)
}

fn mesh(factor: usize) -> (MeshCoordinator, Arc<InMemoryNetwork>) {
    build_mesh(settings(factor), Arc::new(DigestBackend::new()))
}

/// Output depends on the node type, so two different types never agree.
struct TypeTaggedBackend;

#[async_trait]
impl ExecutionBackend for TypeTaggedBackend {
    async fn run(&self, content: &Bytes, node: &MeshNode) -> Result<String, BackendError> {
        Ok(format!("{}:{}", node.node_type, content.len()))
    }
}

/// Local nodes hang long enough to hit any test timeout.
struct SlowLocalBackend;

#[async_trait]
impl ExecutionBackend for SlowLocalBackend {
    async fn run(&self, content: &Bytes, node: &MeshNode) -> Result<String, BackendError> {
        if node.node_type == NodeType::Local {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Ok(DigestBackend::output_for(content))
    }
}

struct FailingBackend;

#[async_trait]
impl ExecutionBackend for FailingBackend {
    async fn run(&self, _content: &Bytes, node: &MeshNode) -> Result<String, BackendError> {
        Err(BackendError::ExecutionFailed {
            node: node.id.clone(),
            reason: "interpreter crashed".to_string(),
        })
    }
}

#[tokio::test]
async fn test_abc_scenario_routes_through_b() {
    let (mesh, _network) = mesh(2);

    let route = mesh.shortest_path(&node("A"), &node("C")).unwrap();
    assert_eq!(route.total_latency_ms, 100);
    assert_eq!(route.nodes, vec![node("A"), node("B"), node("C")]);

    let id = mesh.add_file("main.py", SOURCE, &node("A")).await.unwrap();
    let status = mesh.get_replication_status(&id).await.unwrap();
    assert_eq!(status.replicas.len(), 2);
    assert_eq!(status.replicas[0].node_id, node("A"));
    assert_eq!(status.replicas[1].node_id, node("B"));
    assert_eq!(status.sync_state, SyncState::Synced);
    assert_eq!(status.version, 1);

    let report = mesh.guardians().report(&id);
    assert_eq!(report.primary.map(|g| g.node_id), Some(node("A")));
    assert_eq!(report.secondaries.len(), 1);
}

#[tokio::test]
async fn test_add_file_twice_is_rejected() {
    let (mesh, _network) = mesh(2);
    mesh.add_file("main.py", SOURCE, &node("A")).await.unwrap();

    let err = mesh.add_file("main.py", "other", &node("B")).await.unwrap_err();
    assert!(matches!(err, MeshError::DuplicateArtifact { .. }));
}

#[tokio::test]
async fn test_identical_sync_keeps_version() {
    let (mesh, _network) = mesh(2);
    let id = mesh.add_file("main.py", SOURCE, &node("A")).await.unwrap();

    assert!(mesh.sync_file(&id, SOURCE, &node("A")).await.unwrap());
    mesh.settle().await;

    let status = mesh.get_replication_status(&id).await.unwrap();
    assert_eq!(status.version, 1);
    assert_eq!(status.sync_state, SyncState::Synced);
}

#[tokio::test]
async fn test_sync_propagates_and_versions_increase() {
    let (mesh, network) = mesh(3);
    let id = mesh.add_file("main.py", SOURCE, &node("A")).await.unwrap();

    let mut last_version = 1;
    for round in 0..3 {
        let content = format!("{SOURCE}# round {round}\n");
        assert!(mesh.sync_file(&id, content.clone(), &node("A")).await.unwrap());
        mesh.settle().await;

        let status = mesh.get_replication_status(&id).await.unwrap();
        assert!(status.version > last_version);
        last_version = status.version;
        assert_eq!(status.sync_state, SyncState::Synced);
        for replica in &status.replicas {
            assert_eq!(replica.hash, status.content_hash);
        }
        assert_eq!(
            network.stored(&node("C"), &id),
            Some((status.version, Bytes::from(content)))
        );
    }

    let stats = mesh.sync_stats();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.successful, 3);
}

#[tokio::test]
async fn test_unavailable_secondary_stays_consistent() {
    let (mesh, _network) = mesh(2);
    let id = mesh.add_file("main.py", SOURCE, &node("A")).await.unwrap();

    mesh.mark_unavailable(&node("B")).await.unwrap();

    let status = mesh.get_replication_status(&id).await.unwrap();
    let b = status.replicas.iter().find(|r| r.node_id == node("B")).unwrap();
    assert!(!b.available);
    assert!(b.consistent);
    assert_eq!(status.sync_state, SyncState::Synced);

    let err = mesh.execute_code(&id, ExecutionContext::Edge, &node("A")).await.unwrap_err();
    assert!(matches!(
        err,
        MeshError::NoEligibleNode {
            context: ExecutionContext::Edge,
            ..
        }
    ));

    // Another edge node takes over once it joins.
    mesh.initialize_mesh(vec![NodeSpec::new("D", NodeType::Edge)]).unwrap();
    mesh.connect_nodes(&node("A"), &node("D"), 30, 100).unwrap();
    let result = mesh.execute_code(&id, ExecutionContext::Edge, &node("A")).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.served_by, Some(node("D")));
}

#[tokio::test]
async fn test_forced_divergence_and_resolution() {
    let (mesh, _network) = mesh(2);
    let id = mesh.add_file("main.py", SOURCE, &node("A")).await.unwrap();

    assert!(mesh.record_local_edit(&id, &node("B"), "print('fork')").await.unwrap());
    let conflict = mesh.detect_conflict(&id).await.unwrap().expect("conflict");
    assert_eq!(conflict.reason, ConflictReason::ReplicaDivergence);
    assert_eq!(conflict.divergent_nodes, vec![node("B")]);

    let status = mesh.get_replication_status(&id).await.unwrap();
    assert_eq!(status.sync_state, SyncState::Conflict);
    assert!(!status.consistent);

    let err = mesh.sync_file(&id, "new", &node("A")).await.unwrap_err();
    assert!(matches!(err, MeshError::ConflictUnresolved { .. }));
    let err = mesh.execute_code(&id, ExecutionContext::Local, &node("A")).await.unwrap_err();
    assert!(matches!(err, MeshError::ConflictUnresolved { .. }));

    assert!(mesh.resolve_conflict(&id, &node("B")).await.unwrap());
    let status = mesh.get_replication_status(&id).await.unwrap();
    assert_eq!(status.sync_state, SyncState::Synced);
    assert_eq!(status.version, 2);
    assert_eq!(
        mesh.open_file("main.py", &node("A")).await.unwrap(),
        Bytes::from_static(b"print('fork')")
    );

    assert!(!mesh.resolve_conflict(&id, &node("B")).await.unwrap());
    assert_eq!(mesh.get_replication_status(&id).await.unwrap().version, 2);
}

#[tokio::test]
async fn test_stale_writer_is_recorded_as_conflict() {
    let (mesh, network) = mesh(2);
    let id = mesh.add_file("main.py", SOURCE, &node("A")).await.unwrap();

    // B never receives version 2.
    network.partition(&node("B"));
    assert!(mesh.sync_file(&id, "v2", &node("A")).await.unwrap());
    mesh.settle().await;
    let status = mesh.get_replication_status(&id).await.unwrap();
    let b = status.replicas.iter().find(|r| r.node_id == node("B")).unwrap();
    assert_eq!(b.status, ReplicaStatus::Pending);
    assert_eq!(status.sync_state, SyncState::Pending);

    network.heal(&node("B"));
    assert!(!mesh.sync_file(&id, "v2 from b", &node("B")).await.unwrap());

    let status = mesh.get_replication_status(&id).await.unwrap();
    assert_eq!(status.sync_state, SyncState::Conflict);
    assert_eq!(status.version, 2);
    assert_eq!(mesh.open_file("main.py", &node("A")).await.unwrap(), Bytes::from_static(b"v2"));

    assert!(mesh.resolve_conflict(&id, &node("A")).await.unwrap());
    assert_eq!(mesh.get_replication_status(&id).await.unwrap().sync_state, SyncState::Synced);
}

#[tokio::test]
async fn test_catch_up_on_mark_available() {
    let (mesh, network) = mesh(2);
    let id = mesh.add_file("main.py", SOURCE, &node("A")).await.unwrap();

    mesh.mark_unavailable(&node("B")).await.unwrap();
    assert!(mesh.sync_file(&id, "v2", &node("A")).await.unwrap());
    mesh.settle().await;
    let status = mesh.get_replication_status(&id).await.unwrap();
    let b = status.replicas.iter().find(|r| r.node_id == node("B")).unwrap();
    assert_eq!(b.status, ReplicaStatus::Pending);
    assert_eq!(b.version, 1);

    mesh.mark_available(&node("B")).await.unwrap();
    mesh.settle().await;

    let status = mesh.get_replication_status(&id).await.unwrap();
    let b = status.replicas.iter().find(|r| r.node_id == node("B")).unwrap();
    assert!(b.consistent);
    assert_eq!(b.version, 2);
    assert_eq!(network.stored(&node("B"), &id), Some((2, Bytes::from_static(b"v2"))));
}

#[tokio::test]
async fn test_all_replicas_unreachable_is_diverged() {
    let (mesh, _network) = mesh(2);
    let id = mesh.add_file("main.py", SOURCE, &node("A")).await.unwrap();

    mesh.mark_unavailable(&node("A")).await.unwrap();
    mesh.mark_unavailable(&node("B")).await.unwrap();

    let status = mesh.get_replication_status(&id).await.unwrap();
    assert_eq!(status.sync_state, SyncState::Diverged);

    let err = mesh.sync_file(&id, "v2", &node("C")).await.unwrap_err();
    assert!(matches!(err, MeshError::InsufficientReplicas { .. }));
}

#[tokio::test]
async fn test_hybrid_mismatch_opens_conflict() {
    let (mesh, _network) = build_mesh(settings(3), Arc::new(TypeTaggedBackend));
    let id = mesh.add_file("main.py", SOURCE, &node("A")).await.unwrap();

    let result = mesh.execute_code(&id, ExecutionContext::Hybrid, &node("A")).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Mismatch);
    assert_eq!(result.served_by, Some(node("A")));
    assert_eq!(result.outcomes.len(), 2);

    let status = mesh.get_replication_status(&id).await.unwrap();
    assert_eq!(status.sync_state, SyncState::Conflict);
    assert_eq!(status.conflict.map(|c| c.reason), Some(ConflictReason::ExecutionMismatch));

    assert!(mesh.resolve_conflict(&id, &node("A")).await.unwrap());
    assert_eq!(mesh.get_replication_status(&id).await.unwrap().sync_state, SyncState::Synced);
    assert_eq!(mesh.execution_stats().mismatched, 1);
}

#[tokio::test]
async fn test_hybrid_backup_serves_when_primary_times_out() {
    let settings = MeshSettings {
        execution_timeout_ms: 50,
        hybrid_deadline_ms: 300,
        ..settings(2)
    };
    let (mesh, _network) = build_mesh(settings, Arc::new(SlowLocalBackend));
    let id = mesh.add_file("main.py", SOURCE, &node("A")).await.unwrap();

    let result = mesh.execute_code(&id, ExecutionContext::Hybrid, &node("A")).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.served_by, Some(node("B")));
    assert!(result.failover);
    assert!(result.outcomes[&node("A")].is_timeout());
    assert_eq!(result.output, Some(DigestBackend::output_for(SOURCE.as_bytes())));
}

#[tokio::test]
async fn test_timeout_when_nothing_completes() {
    let settings = MeshSettings {
        execution_timeout_ms: 50,
        hybrid_deadline_ms: 100,
        ..settings(2)
    };
    let (mesh, _network) = build_mesh(settings, Arc::new(SlowLocalBackend));
    let id = mesh.add_file("main.py", SOURCE, &node("A")).await.unwrap();

    let err = mesh.execute_code(&id, ExecutionContext::Local, &node("A")).await.unwrap_err();
    assert!(matches!(err, MeshError::Timeout { timeout_ms: 50, .. }));

    let history = mesh.execution_history(&id);
    assert_eq!(history.len(), 1);
    assert!(history[0].result.is_none());
    assert!(history[0].error.is_some());
    assert_eq!(mesh.execution_stats().timed_out, 1);
}

#[tokio::test]
async fn test_backend_failure_is_reported() {
    let (mesh, _network) = build_mesh(settings(2), Arc::new(FailingBackend));
    let id = mesh.add_file("main.py", SOURCE, &node("A")).await.unwrap();

    let result = mesh.execute_code(&id, ExecutionContext::Cloud, &node("A")).await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.served_by, None);
    assert_eq!(result.output, None);
    assert_eq!(mesh.execution_stats().failed, 1);
}

#[tokio::test]
async fn test_decommission_promotes_secondary() {
    let (mesh, _network) = mesh(3);
    let id = mesh.add_file("main.py", SOURCE, &node("A")).await.unwrap();

    let promoted = mesh.decommission_node(&node("A")).await.unwrap();
    assert_eq!(promoted.len(), 1);

    let guardian = mesh.guardians().get(&promoted[0]).unwrap();
    assert!(guardian.is_primary);
    assert_ne!(guardian.node_id, node("A"));

    let status = mesh.get_replication_status(&id).await.unwrap();
    assert_eq!(status.primary_node, guardian.node_id);
    assert_eq!(mesh.guardians().report(&id).primary.map(|g| g.id), Some(promoted[0]));

    let err = mesh.mark_available(&node("A")).await.unwrap_err();
    assert!(matches!(err, MeshError::NodeDecommissioned(_)));

    // Writes keep flowing through the new primary.
    assert!(mesh.sync_file(&id, "v2", &guardian.node_id).await.unwrap());
}

#[tokio::test]
async fn test_health_probes_track_partitions() {
    let (mesh, network) = mesh(2);

    network.partition(&node("C"));
    network.set_load(&node("B"), 0.8);
    assert_eq!(mesh.run_health_probes(&*network).await, 2);
    assert_eq!(mesh.topology().get(&node("C")).unwrap().status, NodeStatus::Offline);
    assert_eq!(mesh.topology().get(&node("B")).unwrap().status, NodeStatus::Degraded);

    network.heal(&node("C"));
    network.set_load(&node("B"), 0.1);
    assert_eq!(mesh.run_health_probes(&*network).await, 2);

    let status = mesh.get_mesh_status().await;
    assert_eq!(status.network_health.online_nodes, 3);
}

#[tokio::test]
async fn test_coordinator_from_config() {
    let manifest = MeshConfigManifest::from_yaml_str(
        r#"
apiVersion: codemesh.dev/v1
kind: MeshConfig
metadata:
  name: lab
spec:
  replication:
    factor: 2
  nodes:
    - id: laptop
      type: local
    - id: edge-1
      type: edge
    - id: vm
      type: cloud
  connections:
    - a: laptop
      b: edge-1
      latency_ms: 20
    - a: edge-1
      b: vm
      latency_ms: 80
"#,
    )
    .unwrap();
    manifest.validate().unwrap();

    let mesh = MeshCoordinator::from_config(
        &manifest,
        Arc::new(InMemoryNetwork::new()),
        Arc::new(DigestBackend::new()),
    )
    .unwrap();

    let route = mesh.shortest_path(&node("laptop"), &node("vm")).unwrap();
    assert_eq!(route.total_latency_ms, 100);

    let id = mesh.add_file("main.py", SOURCE, &node("laptop")).await.unwrap();
    let result = mesh.execute_code(&id, ExecutionContext::Cloud, &node("laptop")).await.unwrap();
    assert_eq!(result.served_by, Some(node("vm")));

    let status = mesh.get_mesh_status().await;
    assert_eq!(status.total_files, 1);
    assert_eq!(status.executions, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_syncs_from_one_origin_apply_in_order() {
    let (mesh, _network) = mesh(3);
    let mesh = Arc::new(mesh);
    let id = mesh.add_file("main.py", SOURCE, &node("A")).await.unwrap();

    let writers: Vec<_> = (0..20)
        .map(|i| {
            let mesh = mesh.clone();
            tokio::spawn(async move { mesh.sync_file(&id, format!("{SOURCE}# edit {i}\n"), &node("A")).await })
        })
        .collect();
    for writer in writers {
        assert!(writer.await.unwrap().unwrap());
    }
    mesh.settle().await;

    let status = mesh.get_replication_status(&id).await.unwrap();
    assert_eq!(status.version, 21);
    assert_eq!(status.sync_state, SyncState::Synced);
    for replica in &status.replicas {
        assert_eq!(replica.version, 21);
        assert_eq!(replica.hash, status.content_hash);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_writers_leave_one_winner_and_a_conflict() {
    // Slow deliveries keep the loser's copy behind the winner's version.
    let network = Arc::new(InMemoryNetwork::with_delay(Duration::from_millis(200)));
    let (mesh, _network) = build_mesh_over(settings(2), network, Arc::new(DigestBackend::new()));
    let mesh = Arc::new(mesh);
    let id = mesh.add_file("main.py", SOURCE, &node("A")).await.unwrap();

    let writers: Vec<_> = ["A", "B"]
        .into_iter()
        .map(|origin| {
            let mesh = mesh.clone();
            tokio::spawn(async move { mesh.sync_file(&id, format!("written by {origin}"), &node(origin)).await })
        })
        .collect();
    let mut applied = 0;
    for writer in writers {
        if writer.await.unwrap().unwrap() {
            applied += 1;
        }
    }
    mesh.settle().await;

    assert_eq!(applied, 1);
    let status = mesh.get_replication_status(&id).await.unwrap();
    assert_eq!(status.sync_state, SyncState::Conflict);
    assert_eq!(status.version, 2);
    assert_eq!(status.conflict.map(|c| c.divergent_nodes.len()), Some(1));
}
