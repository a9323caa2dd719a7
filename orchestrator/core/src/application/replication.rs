// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Replication Manager
//!
//! Tracks every artifact and its replicas, versions writes and propagates
//! them through a [`ReplicaTransport`].
//!
//! ## Locking
//!
//! Each artifact sits behind its own `tokio::sync::Mutex`; there is no global
//! lock, so writes to different artifacts proceed concurrently. Conflict
//! detection and guardian notification run after the write lock is released.
//!
//! ## Propagation
//!
//! A sync spawns one push task per reachable replica and returns without
//! waiting. Offline replicas stay pending until [`ReplicationManager::catch_up`].
//! A push only lands on a still-pending replica while the artifact is at the
//! pushed version, so late deliveries can never roll a replica back.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::guardians::GuardianSystem;
use crate::domain::artifact::{
    AccessKind, Artifact, ArtifactId, ConflictReason, ConflictRecord, ContentHash, ReplicaPush, ReplicaStatus,
    SyncState,
};
use crate::domain::error::{MeshError, MeshResult};
use crate::domain::guardian::GuardianId;
use crate::domain::events::ReplicationEvent;
use crate::domain::mesh_config::MeshSettings;
use crate::domain::node::{NodeId, NodeType};
use crate::domain::runtime::{ReplicaTransport, TransportError};
use crate::domain::topology::TopologyRegistry;
use crate::infrastructure::event_bus::EventBus;

/// Result of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Content matched the current version
    Unchanged,
    /// Write accepted as a new version
    Applied { version: u64 },
    /// Writer had not seen the current version; recorded as divergent
    Conflicted,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Unchanged => "unchanged",
            SyncOutcome::Applied { .. } => "applied",
            SyncOutcome::Conflicted => "conflicted",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncEvent {
    pub event_id: Uuid,
    pub artifact_id: ArtifactId,
    pub source_node: NodeId,
    pub target_nodes: Vec<NodeId>,
    pub old_hash: ContentHash,
    pub new_hash: ContentHash,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub conflicts_detected: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicaView {
    pub node_id: NodeId,
    pub node_type: Option<NodeType>,
    pub version: u64,
    pub hash: ContentHash,
    pub status: ReplicaStatus,
    pub available: bool,
    pub consistent: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicationStatus {
    pub artifact_id: ArtifactId,
    pub path: String,
    pub primary_node: NodeId,
    pub sync_state: SyncState,
    pub version: u64,
    pub content_hash: ContentHash,
    pub consistent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictRecord>,
    pub replicas: Vec<ReplicaView>,
}

/// Where an artifact's usable copies live, as seen by the router.
#[derive(Debug, Clone)]
pub struct Placement {
    pub artifact_id: ArtifactId,
    pub version: u64,
    pub conflict: Option<ConflictRecord>,
    /// Reachable nodes holding a consistent replica
    pub holders: BTreeSet<NodeId>,
    pub replica_nodes: Vec<NodeId>,
}

#[derive(Debug, Clone)]
struct PushPolicy {
    retries: u32,
    base_delay: Duration,
}

type ArtifactHandle = Arc<tokio::sync::Mutex<Artifact>>;

pub struct ReplicationManager {
    artifacts: DashMap<ArtifactId, ArtifactHandle>,
    topology: Arc<TopologyRegistry>,
    guardians: Arc<GuardianSystem>,
    transport: Arc<dyn ReplicaTransport>,
    event_bus: EventBus,
    replication_factor: usize,
    policy: PushPolicy,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
    sync_log: RwLock<Vec<SyncEvent>>,
    conflicts_detected: Mutex<u64>,
}

impl ReplicationManager {
    pub fn new(
        topology: Arc<TopologyRegistry>,
        guardians: Arc<GuardianSystem>,
        transport: Arc<dyn ReplicaTransport>,
        event_bus: EventBus,
        settings: &MeshSettings,
    ) -> Self {
        Self {
            artifacts: DashMap::new(),
            topology,
            guardians,
            transport,
            event_bus,
            replication_factor: settings.replication_factor.max(1),
            policy: PushPolicy {
                retries: settings.push_retries,
                base_delay: Duration::from_millis(settings.push_retry_delay_ms),
            },
            in_flight: Mutex::new(Vec::new()),
            sync_log: RwLock::new(Vec::new()),
            conflicts_detected: Mutex::new(0),
        }
    }

    fn handle(&self, artifact_id: &ArtifactId) -> MeshResult<ArtifactHandle> {
        self.artifacts
            .get(artifact_id)
            .map(|entry| entry.value().clone())
            .ok_or(MeshError::ArtifactNotFound(*artifact_id))
    }

    fn require_reachable(&self, node_id: &NodeId) -> MeshResult<()> {
        let node = self.topology.get(node_id)?;
        if !node.is_reachable() {
            return Err(MeshError::NodeUnavailable {
                node_id: node_id.clone(),
                status: node.status,
            });
        }
        Ok(())
    }

    /// Register a new artifact on `primary` and seed `factor - 1` replicas.
    pub async fn add_artifact(&self, path: &str, content: Bytes, primary: &NodeId) -> MeshResult<ArtifactId> {
        self.require_reachable(primary)?;

        let mut artifact = Artifact::new(path, content, primary.clone());
        let artifact_id = artifact.id;
        let hash = artifact.content_hash().clone();

        let wanted = self.replication_factor - 1;
        let targets = self.topology.select_replica_targets(primary, wanted);
        if targets.len() < wanted {
            warn!(
                %artifact_id,
                wanted = self.replication_factor,
                placed = targets.len() + 1,
                "Mesh too small for replication factor; creating fewer replicas"
            );
        }
        let pushes: Vec<ReplicaPush> = targets
            .iter()
            .filter_map(|node| artifact.add_pending_replica(node.clone()))
            .collect();

        let duplicate = || MeshError::DuplicateArtifact {
            artifact_id,
            path: path.to_string(),
        };
        if self.artifacts.contains_key(&artifact_id) {
            return Err(duplicate());
        }

        // Guardians exist before the artifact is visible to sync.
        let (primary_guardian, secondary_guardians) = self.spawn_guardians(artifact_id, primary, &targets, &hash)?;
        artifact.primary_guardian = Some(primary_guardian);
        artifact.secondary_guardians = secondary_guardians.clone();

        let handle = Arc::new(tokio::sync::Mutex::new(artifact));
        match self.artifacts.entry(artifact_id) {
            Entry::Occupied(_) => {
                for guardian_id in std::iter::once(&primary_guardian).chain(secondary_guardians.iter()) {
                    let _ = self.guardians.retire(guardian_id);
                }
                return Err(duplicate());
            }
            Entry::Vacant(slot) => {
                slot.insert(handle.clone());
            }
        }
        for node in std::iter::once(primary).chain(targets.iter()) {
            self.topology.record_hosting(node, artifact_id);
        }

        // Seed copies are delivered before the artifact is handed back.
        let deliveries = pushes.into_iter().map(|push| {
            deliver(
                handle.clone(),
                self.transport.clone(),
                self.event_bus.clone(),
                self.policy.clone(),
                push,
            )
        });
        join_all(deliveries).await;

        info!(%artifact_id, path, primary = %primary, replicas = targets.len() + 1, "Added artifact");
        self.event_bus.publish_replication_event(ReplicationEvent::ArtifactAdded {
            artifact_id,
            path: path.to_string(),
            primary_node: primary.clone(),
            replicas: std::iter::once(primary.clone()).chain(targets).collect(),
            added_at: Utc::now(),
        });
        Ok(artifact_id)
    }

    /// Spawn the primary and secondary guardians of a new artifact. On failure
    /// the guardians spawned so far are retired.
    fn spawn_guardians(
        &self,
        artifact_id: ArtifactId,
        primary: &NodeId,
        targets: &[NodeId],
        hash: &ContentHash,
    ) -> MeshResult<(GuardianId, Vec<GuardianId>)> {
        let primary_guardian = self.guardians.create_primary(artifact_id, primary, hash.clone())?;
        let mut secondaries = Vec::with_capacity(targets.len());
        for node in targets {
            match self.guardians.add_secondary(artifact_id, node, hash.clone()) {
                Ok(guardian_id) => secondaries.push(guardian_id),
                Err(e) => {
                    for guardian_id in std::iter::once(&primary_guardian).chain(secondaries.iter()) {
                        let _ = self.guardians.retire(guardian_id);
                    }
                    return Err(e);
                }
            }
        }
        Ok((primary_guardian, secondaries))
    }

    /// Write `content` to the artifact on behalf of `origin`.
    pub async fn sync(&self, artifact_id: &ArtifactId, content: Bytes, origin: &NodeId) -> MeshResult<SyncOutcome> {
        let handle = self.handle(artifact_id)?;
        self.require_reachable(origin)?;

        let new_hash = ContentHash::of(&content);
        let mut new_holder = false;
        let (outcome, old_hash, targets) = {
            let mut artifact = handle.lock().await;

            if let Some(conflict) = artifact.conflict() {
                return Err(MeshError::ConflictUnresolved {
                    artifact_id: *artifact_id,
                    divergent_nodes: conflict.divergent_nodes.clone(),
                });
            }

            let reachable = self.topology.reachable_set();
            if !artifact.has_reachable_replica(|n| reachable.contains(n)) {
                return Err(MeshError::InsufficientReplicas {
                    artifact_id: *artifact_id,
                    total: artifact.replicas().len(),
                });
            }

            let old_hash = artifact.content_hash().clone();
            if new_hash == old_hash {
                debug!(%artifact_id, origin = %origin, "Sync carried unchanged content");
                (SyncOutcome::Unchanged, old_hash, Vec::new())
            } else {
                if artifact.add_current_replica(origin.clone()) {
                    new_holder = true;
                }

                let origin_consistent = artifact
                    .replica(origin)
                    .is_some_and(|replica| artifact.is_replica_consistent(replica));

                if !origin_consistent {
                    artifact.record_local_edit(origin, content);
                    artifact.log_access(origin.clone(), AccessKind::Write);
                    warn!(%artifact_id, origin = %origin, "Write from a replica that missed the current version");
                    (SyncOutcome::Conflicted, old_hash, Vec::new())
                } else {
                    let targets = artifact.apply_write(origin, content, new_hash.clone());
                    artifact.log_access(origin.clone(), AccessKind::Write);
                    let version = artifact.version();

                    for node in &targets {
                        let pending = artifact.replica(node).is_some_and(|r| r.status == ReplicaStatus::Pending);
                        if pending && reachable.contains(node) {
                            let push = artifact.push_for(node.clone());
                            self.spawn_push(handle.clone(), push);
                        }
                    }
                    (SyncOutcome::Applied { version }, old_hash, targets)
                }
            }
        };

        if new_holder {
            self.topology.record_hosting(origin, *artifact_id);
            if let Err(e) = self.guardians.add_secondary(*artifact_id, origin, old_hash.clone()) {
                warn!(%artifact_id, node = %origin, error = %e, "Failed to spawn guardian for new holder");
            }
        }

        counter!("codemesh_syncs_total", "outcome" => outcome.as_str()).increment(1);
        match outcome {
            SyncOutcome::Unchanged => {}
            SyncOutcome::Applied { version } => {
                info!(%artifact_id, origin = %origin, version, targets = targets.len(), "Applied sync");
                self.guardians.on_change(artifact_id, &new_hash);
                self.detect_conflict(artifact_id).await?;
                self.event_bus.publish_replication_event(ReplicationEvent::ArtifactSynced {
                    artifact_id: *artifact_id,
                    origin: origin.clone(),
                    version,
                    hash: new_hash.clone(),
                    synced_at: Utc::now(),
                });
            }
            SyncOutcome::Conflicted => {
                self.detect_conflict(artifact_id).await?;
            }
        }

        self.record_sync_event(SyncEvent {
            event_id: Uuid::new_v4(),
            artifact_id: *artifact_id,
            source_node: origin.clone(),
            target_nodes: targets,
            old_hash,
            new_hash,
            timestamp: Utc::now(),
            success: outcome != SyncOutcome::Conflicted,
        });
        Ok(outcome)
    }

    fn spawn_push(&self, handle: ArtifactHandle, push: ReplicaPush) {
        let task = tokio::spawn(deliver(
            handle,
            self.transport.clone(),
            self.event_bus.clone(),
            self.policy.clone(),
            push,
        ));
        let mut in_flight = self.in_flight.lock();
        in_flight.retain(|t| !t.is_finished());
        in_flight.push(task);
    }

    /// Wait until every spawned push has finished.
    pub async fn settle(&self) {
        loop {
            let tasks = std::mem::take(&mut *self.in_flight.lock());
            if tasks.is_empty() {
                return;
            }
            for result in join_all(tasks).await {
                if let Err(e) = result {
                    warn!(error = %e, "Replica push task aborted");
                }
            }
        }
    }

    /// Compare reachable replicas and open a conflict if they disagree.
    pub async fn detect_conflict(&self, artifact_id: &ArtifactId) -> MeshResult<Option<ConflictRecord>> {
        let handle = self.handle(artifact_id)?;
        let mut artifact = handle.lock().await;

        if let Some(existing) = artifact.conflict() {
            return Ok(Some(existing.clone()));
        }

        let reachable = self.topology.reachable_set();
        let Some(record) = artifact.detect_divergence(|n| reachable.contains(n)) else {
            return Ok(None);
        };
        artifact.open_conflict(record.clone());
        drop(artifact);

        self.note_conflict(artifact_id, &record);
        Ok(Some(record))
    }

    /// Open a conflict raised outside replica comparison (e.g. an execution mismatch).
    pub async fn flag_conflict(
        &self,
        artifact_id: &ArtifactId,
        reason: ConflictReason,
        nodes: Vec<NodeId>,
    ) -> MeshResult<ConflictRecord> {
        let handle = self.handle(artifact_id)?;
        let mut artifact = handle.lock().await;

        let record = ConflictRecord {
            reason,
            hashes: nodes
                .iter()
                .filter_map(|n| artifact.replica(n).map(|r| (n.clone(), r.hash.clone())))
                .collect(),
            divergent_nodes: nodes,
            detected_at: Utc::now(),
        };
        artifact.open_conflict(record.clone());
        drop(artifact);

        self.note_conflict(artifact_id, &record);
        Ok(record)
    }

    fn note_conflict(&self, artifact_id: &ArtifactId, record: &ConflictRecord) {
        *self.conflicts_detected.lock() += 1;
        counter!("codemesh_conflicts_total", "reason" => record.reason.as_str()).increment(1);
        warn!(
            %artifact_id,
            reason = record.reason.as_str(),
            nodes = ?record.divergent_nodes,
            "Conflict detected"
        );
        self.event_bus.publish_replication_event(ReplicationEvent::ConflictDetected {
            artifact_id: *artifact_id,
            reason: record.reason,
            divergent_nodes: record.divergent_nodes.clone(),
            detected_at: record.detected_at,
        });
    }

    /// Make `winner`'s copy authoritative. Returns `false` when there was
    /// nothing to resolve.
    pub async fn resolve_conflict(&self, artifact_id: &ArtifactId, winner: &NodeId) -> MeshResult<bool> {
        let handle = self.handle(artifact_id)?;

        let (pushes, version, hash, old_hash) = {
            let mut artifact = handle.lock().await;
            let Some(replica) = artifact.replica(winner) else {
                return Err(MeshError::ReplicaNotFound {
                    artifact_id: *artifact_id,
                    node_id: winner.clone(),
                });
            };
            let winner_hash = replica.hash.clone();
            self.require_reachable(winner)?;

            let reachable = self.topology.reachable_set();
            if artifact.is_consistent(|n| reachable.contains(n)) && &winner_hash == artifact.content_hash() {
                debug!(%artifact_id, winner = %winner, "Nothing to resolve");
                return Ok(false);
            }

            let old_hash = artifact.content_hash().clone();
            let targets = artifact.adopt_winner(winner).unwrap_or_default();
            let pushes: Vec<ReplicaPush> = targets
                .into_iter()
                .filter(|n| reachable.contains(n))
                .map(|n| artifact.push_for(n))
                .collect();
            (pushes, artifact.version(), artifact.content_hash().clone(), old_hash)
        };

        let targets: Vec<NodeId> = pushes.iter().map(|p| p.node_id.clone()).collect();
        let deliveries = pushes.into_iter().map(|push| {
            deliver(
                handle.clone(),
                self.transport.clone(),
                self.event_bus.clone(),
                self.policy.clone(),
                push,
            )
        });
        join_all(deliveries).await;

        self.guardians.on_change(artifact_id, &hash);
        info!(%artifact_id, winner = %winner, version, "Resolved conflict");
        self.event_bus.publish_replication_event(ReplicationEvent::ConflictResolved {
            artifact_id: *artifact_id,
            winner: winner.clone(),
            version,
            resolved_at: Utc::now(),
        });
        self.record_sync_event(SyncEvent {
            event_id: Uuid::new_v4(),
            artifact_id: *artifact_id,
            source_node: winner.clone(),
            target_nodes: targets,
            old_hash,
            new_hash: hash,
            timestamp: Utc::now(),
            success: true,
        });
        Ok(true)
    }

    /// Give `node_id` a copy of the current version. Returns `false` when it
    /// already held a replica (a lagging one is caught up instead).
    pub async fn add_replica(&self, artifact_id: &ArtifactId, node_id: &NodeId) -> MeshResult<bool> {
        let handle = self.handle(artifact_id)?;
        self.require_reachable(node_id)?;

        let (push, created, hash) = {
            let mut artifact = handle.lock().await;
            let hash = artifact.content_hash().clone();
            if artifact.replica(node_id).is_some() {
                (artifact.catch_up_push(node_id), false, hash)
            } else {
                (artifact.add_pending_replica(node_id.clone()), true, hash)
            }
        };

        if let Some(push) = push {
            deliver(
                handle.clone(),
                self.transport.clone(),
                self.event_bus.clone(),
                self.policy.clone(),
                push,
            )
            .await;
        }

        if created {
            self.topology.record_hosting(node_id, *artifact_id);
            let guardian_id = self.guardians.add_secondary(*artifact_id, node_id, hash)?;
            handle.lock().await.secondary_guardians.push(guardian_id);
            info!(%artifact_id, node = %node_id, "Added replica");
        }
        Ok(created)
    }

    /// Record content found on a node that did not arrive through sync.
    /// Returns `true` when it diverges from the accepted content.
    pub async fn record_local_edit(&self, artifact_id: &ArtifactId, node_id: &NodeId, content: Bytes) -> MeshResult<bool> {
        let handle = self.handle(artifact_id)?;
        let mut artifact = handle.lock().await;
        let diverged = artifact
            .record_local_edit(node_id, content)
            .ok_or_else(|| MeshError::ReplicaNotFound {
                artifact_id: *artifact_id,
                node_id: node_id.clone(),
            })?;
        artifact.log_access(node_id.clone(), AccessKind::Write);
        if diverged {
            debug!(%artifact_id, node = %node_id, "Local edit diverges from accepted content");
        }
        Ok(diverged)
    }

    /// Schedule pushes for every replica on `node_id` that missed a version.
    pub async fn catch_up(&self, node_id: &NodeId) -> usize {
        let handles: Vec<ArtifactHandle> = self.artifacts.iter().map(|e| e.value().clone()).collect();

        let mut scheduled = 0;
        for handle in handles {
            let push = handle.lock().await.catch_up_push(node_id);
            if let Some(push) = push {
                self.spawn_push(handle, push);
                scheduled += 1;
            }
        }
        if scheduled > 0 {
            info!(node = %node_id, scheduled, "Catching up lagging replicas");
        }
        scheduled
    }

    pub async fn remove_artifact(&self, artifact_id: &ArtifactId) -> MeshResult<()> {
        let (_, handle) = self
            .artifacts
            .remove(artifact_id)
            .ok_or(MeshError::ArtifactNotFound(*artifact_id))?;

        let artifact = handle.lock().await;
        for replica in artifact.replicas() {
            self.topology.release_hosting(&replica.node_id, artifact_id);
        }
        self.guardians.retire_artifact(artifact_id);

        info!(%artifact_id, path = %artifact.path, "Removed artifact");
        self.event_bus.publish_replication_event(ReplicationEvent::ArtifactRemoved {
            artifact_id: *artifact_id,
            removed_at: Utc::now(),
        });
        Ok(())
    }

    pub async fn reassign_primary(&self, artifact_id: &ArtifactId, new_primary: &NodeId) -> MeshResult<()> {
        let handle = self.handle(artifact_id)?;
        let mut artifact = handle.lock().await;
        if artifact.replica(new_primary).is_none() {
            return Err(MeshError::ReplicaNotFound {
                artifact_id: *artifact_id,
                node_id: new_primary.clone(),
            });
        }
        let previous = std::mem::replace(&mut artifact.primary_node, new_primary.clone());
        artifact.primary_guardian = self.guardians.primary_for(artifact_id).map(|g| g.id);
        drop(artifact);

        info!(%artifact_id, from = %previous, to = %new_primary, "Reassigned primary node");
        self.event_bus.publish_replication_event(ReplicationEvent::PrimaryReassigned {
            artifact_id: *artifact_id,
            from: previous,
            to: new_primary.clone(),
        });
        Ok(())
    }

    pub fn find_by_path(&self, path: &str) -> MeshResult<ArtifactId> {
        let artifact_id = ArtifactId::from_path(path);
        if self.artifacts.contains_key(&artifact_id) {
            Ok(artifact_id)
        } else {
            Err(MeshError::ArtifactNotFound(artifact_id))
        }
    }

    /// Current accepted content, logged as a read by `reader`.
    pub async fn read_content(&self, artifact_id: &ArtifactId, reader: &NodeId) -> MeshResult<Bytes> {
        let handle = self.handle(artifact_id)?;
        let mut artifact = handle.lock().await;
        artifact.log_access(reader.clone(), AccessKind::Read);
        Ok(artifact.content().clone())
    }

    pub async fn snapshot(&self, artifact_id: &ArtifactId) -> MeshResult<Artifact> {
        let handle = self.handle(artifact_id)?;
        let artifact = handle.lock().await;
        Ok(artifact.clone())
    }

    pub async fn status(&self, artifact_id: &ArtifactId) -> MeshResult<ReplicationStatus> {
        let artifact = self.snapshot(artifact_id).await?;
        let reachable = self.topology.reachable_set();
        let is_reachable = |n: &NodeId| reachable.contains(n);

        let replicas = artifact
            .replicas()
            .iter()
            .map(|replica| ReplicaView {
                node_id: replica.node_id.clone(),
                node_type: self.topology.get(&replica.node_id).ok().map(|n| n.node_type),
                version: replica.version,
                hash: replica.hash.clone(),
                status: replica.status,
                available: self.topology.is_available(&replica.node_id),
                consistent: artifact.is_replica_consistent(replica),
                updated_at: replica.updated_at,
            })
            .collect();

        Ok(ReplicationStatus {
            artifact_id: artifact.id,
            path: artifact.path.clone(),
            primary_node: artifact.primary_node.clone(),
            sync_state: artifact.sync_state(is_reachable),
            version: artifact.version(),
            content_hash: artifact.content_hash().clone(),
            consistent: artifact.is_consistent(is_reachable),
            conflict: artifact.conflict().cloned(),
            replicas,
        })
    }

    pub async fn placement(&self, artifact_id: &ArtifactId) -> MeshResult<Placement> {
        let artifact = self.snapshot(artifact_id).await?;
        let reachable = self.topology.reachable_set();
        Ok(Placement {
            artifact_id: artifact.id,
            version: artifact.version(),
            conflict: artifact.conflict().cloned(),
            holders: artifact.consistent_holders(|n| reachable.contains(n)),
            replica_nodes: artifact.replicas().iter().map(|r| r.node_id.clone()).collect(),
        })
    }

    /// Artifacts with a replica on `node_id`.
    pub async fn artifacts_on_node(&self, node_id: &NodeId) -> Vec<ArtifactId> {
        let handles: Vec<(ArtifactId, ArtifactHandle)> =
            self.artifacts.iter().map(|e| (*e.key(), e.value().clone())).collect();

        let mut found = Vec::new();
        for (artifact_id, handle) in handles {
            if handle.lock().await.replica(node_id).is_some() {
                found.push(artifact_id);
            }
        }
        found.sort();
        found
    }

    pub fn artifact_ids(&self) -> Vec<ArtifactId> {
        let mut ids: Vec<ArtifactId> = self.artifacts.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub fn count(&self) -> usize {
        self.artifacts.len()
    }

    fn record_sync_event(&self, event: SyncEvent) {
        self.sync_log.write().push(event);
    }

    pub fn sync_events(&self) -> Vec<SyncEvent> {
        self.sync_log.read().clone()
    }

    pub fn sync_stats(&self) -> SyncStats {
        let log = self.sync_log.read();
        let total = log.len();
        let successful = log.iter().filter(|e| e.success).count();
        SyncStats {
            total,
            successful,
            failed: total - successful,
            success_rate: if total == 0 { 0.0 } else { successful as f64 / total as f64 },
            conflicts_detected: *self.conflicts_detected.lock(),
        }
    }
}

/// Push with exponential backoff, then land the content if still wanted.
async fn deliver(
    handle: ArtifactHandle,
    transport: Arc<dyn ReplicaTransport>,
    event_bus: EventBus,
    policy: PushPolicy,
    push: ReplicaPush,
) {
    if let Err(e) = push_with_retry(transport.as_ref(), &push, &policy).await {
        counter!("codemesh_replica_pushes_total", "result" => "failed").increment(1);
        warn!(
            artifact_id = %push.artifact_id,
            node = %push.node_id,
            version = push.version,
            error = %e,
            "Replica push failed; replica stays pending"
        );
        return;
    }

    let applied = handle.lock().await.apply_push(&push);
    if applied {
        counter!("codemesh_replica_pushes_total", "result" => "applied").increment(1);
        event_bus.publish_replication_event(ReplicationEvent::ReplicaUpdated {
            artifact_id: push.artifact_id,
            node_id: push.node_id.clone(),
            version: push.version,
        });
    } else {
        counter!("codemesh_replica_pushes_total", "result" => "stale").increment(1);
        debug!(artifact_id = %push.artifact_id, node = %push.node_id, version = push.version, "Dropped stale push");
    }
}

async fn push_with_retry(
    transport: &dyn ReplicaTransport,
    push: &ReplicaPush,
    policy: &PushPolicy,
) -> Result<(), TransportError> {
    let mut attempt = 0;
    loop {
        match transport.push(push).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < policy.retries => {
                let delay = policy.base_delay * 2u32.saturating_pow(attempt);
                debug!(node = %push.node_id, attempt, error = %e, "Retrying replica push in {:?}", delay);
                counter!("codemesh_replica_pushes_total", "result" => "retried").increment(1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
