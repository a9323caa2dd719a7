// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Artifact Aggregate
//!
//! An [`Artifact`] is a unit of source content tracked by the mesh together
//! with its [`Replica`] records. The aggregate owns the versioning and
//! consistency rules; reachability of nodes is supplied by the caller so the
//! sync state is always derived from live topology data.
//!
//! ## Invariants
//!
//! - At least one replica exists once the artifact is created.
//! - `version` only increases.
//! - A replica's version never exceeds the artifact's version.
//! - The artifact is `Synced` iff every reachable replica is consistent.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use crate::domain::guardian::GuardianId;
use crate::domain::node::NodeId;

/// Identifier derived from the artifact's logical path (UUID v5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactId(pub Uuid);

impl ArtifactId {
    pub fn from_path(path: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("codemesh:{path}").as_bytes()))
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Truncated SHA-256 hex digest of artifact content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
    const LEN: usize = 16;

    pub fn of(content: &[u8]) -> Self {
        let digest = hex::encode(Sha256::digest(content));
        Self(digest[..Self::LEN].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Synced,
    Pending,
    Conflict,
    Diverged,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Synced => "synced",
            SyncState::Pending => "pending",
            SyncState::Conflict => "conflict",
            SyncState::Diverged => "diverged",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaStatus {
    /// Holds the content it was last told about
    Current,
    /// Waiting for a push of the artifact's current version
    Pending,
    /// Edited locally without going through sync
    Divergent,
}

/// One node's copy of an artifact.
#[derive(Debug, Clone)]
pub struct Replica {
    pub node_id: NodeId,
    pub content: Bytes,
    pub hash: ContentHash,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub status: ReplicaStatus,
}

impl Replica {
    fn current(node_id: NodeId, content: Bytes, hash: ContentHash, version: u64) -> Self {
        Self {
            node_id,
            content,
            hash,
            version,
            updated_at: Utc::now(),
            status: ReplicaStatus::Current,
        }
    }

    fn placeholder(node_id: NodeId) -> Self {
        let content = Bytes::new();
        let hash = ContentHash::of(&content);
        Self {
            node_id,
            content,
            hash,
            version: 0,
            updated_at: Utc::now(),
            status: ReplicaStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    /// Reachable replicas disagree on content
    ReplicaDivergence,
    /// Hybrid execution produced different results on two nodes
    ExecutionMismatch,
}

impl ConflictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictReason::ReplicaDivergence => "replica_divergence",
            ConflictReason::ExecutionMismatch => "execution_mismatch",
        }
    }
}

/// Outstanding conflict, cleared only by an explicit resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub reason: ConflictReason,
    pub divergent_nodes: Vec<NodeId>,
    pub hashes: BTreeMap<NodeId, ContentHash>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRecord {
    pub node_id: NodeId,
    pub kind: AccessKind,
    pub at: DateTime<Utc>,
}

/// A replica that must receive a push.
#[derive(Debug, Clone)]
pub struct ReplicaPush {
    pub artifact_id: ArtifactId,
    pub node_id: NodeId,
    pub content: Bytes,
    pub hash: ContentHash,
    pub version: u64,
}

#[derive(Debug, Clone)]
pub struct Artifact {
    pub id: ArtifactId,
    pub path: String,
    pub primary_node: NodeId,
    replicas: Vec<Replica>,
    version: u64,
    content: Bytes,
    content_hash: ContentHash,
    conflict: Option<ConflictRecord>,
    pub primary_guardian: Option<GuardianId>,
    pub secondary_guardians: Vec<GuardianId>,
    access_log: Vec<AccessRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Artifact {
    /// Create the artifact at version 1 with its primary replica.
    pub fn new(path: impl Into<String>, content: Bytes, primary_node: NodeId) -> Self {
        let path = path.into();
        let hash = ContentHash::of(&content);
        let now = Utc::now();
        Self {
            id: ArtifactId::from_path(&path),
            path,
            replicas: vec![Replica::current(primary_node.clone(), content.clone(), hash.clone(), 1)],
            primary_node,
            version: 1,
            content,
            content_hash: hash,
            conflict: None,
            primary_guardian: None,
            secondary_guardians: Vec::new(),
            access_log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn content_hash(&self) -> &ContentHash {
        &self.content_hash
    }

    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    pub fn replica(&self, node_id: &NodeId) -> Option<&Replica> {
        self.replicas.iter().find(|r| &r.node_id == node_id)
    }

    fn replica_mut(&mut self, node_id: &NodeId) -> Option<&mut Replica> {
        self.replicas.iter_mut().find(|r| &r.node_id == node_id)
    }

    pub fn conflict(&self) -> Option<&ConflictRecord> {
        self.conflict.as_ref()
    }

    pub fn access_log(&self) -> &[AccessRecord] {
        &self.access_log
    }

    pub fn is_replica_consistent(&self, replica: &Replica) -> bool {
        replica.status == ReplicaStatus::Current
            && replica.version == self.version
            && replica.hash == self.content_hash
    }

    pub fn has_reachable_replica(&self, reachable: impl Fn(&NodeId) -> bool) -> bool {
        self.replicas.iter().any(|r| reachable(&r.node_id))
    }

    /// Derive the sync state from replica records and live reachability.
    pub fn sync_state(&self, reachable: impl Fn(&NodeId) -> bool) -> SyncState {
        if self.conflict.is_some() {
            return SyncState::Conflict;
        }

        let mut online = self.replicas.iter().filter(|r| reachable(&r.node_id)).peekable();
        if online.peek().is_none() {
            return SyncState::Diverged;
        }

        if online.all(|r| self.is_replica_consistent(r)) {
            SyncState::Synced
        } else {
            SyncState::Pending
        }
    }

    /// True when no conflict is open and every reachable replica is consistent.
    pub fn is_consistent(&self, reachable: impl Fn(&NodeId) -> bool) -> bool {
        self.conflict.is_none()
            && self
                .replicas
                .iter()
                .filter(|r| reachable(&r.node_id))
                .all(|r| self.is_replica_consistent(r))
    }

    /// Nodes holding a consistent replica of the current version.
    pub fn consistent_holders(&self, reachable: impl Fn(&NodeId) -> bool) -> BTreeSet<NodeId> {
        self.replicas
            .iter()
            .filter(|r| reachable(&r.node_id) && self.is_replica_consistent(r))
            .map(|r| r.node_id.clone())
            .collect()
    }

    /// Node whose consistent replica was updated most recently.
    pub fn latest_sync_node(&self) -> &NodeId {
        self.replicas
            .iter()
            .filter(|r| self.is_replica_consistent(r))
            .max_by_key(|r| r.updated_at)
            .map(|r| &r.node_id)
            .unwrap_or(&self.primary_node)
    }

    /// Add a replica already holding the current content (the writer's own copy).
    pub fn add_current_replica(&mut self, node_id: NodeId) -> bool {
        if self.replica(&node_id).is_some() {
            return false;
        }
        self.replicas.push(Replica::current(
            node_id,
            self.content.clone(),
            self.content_hash.clone(),
            self.version,
        ));
        true
    }

    /// Add an empty replica that waits for a push of the current version.
    pub fn add_pending_replica(&mut self, node_id: NodeId) -> Option<ReplicaPush> {
        if self.replica(&node_id).is_some() {
            return None;
        }
        self.replicas.push(Replica::placeholder(node_id.clone()));
        Some(self.push_for(node_id))
    }

    pub fn push_for(&self, node_id: NodeId) -> ReplicaPush {
        ReplicaPush {
            artifact_id: self.id,
            node_id,
            content: self.content.clone(),
            hash: self.content_hash.clone(),
            version: self.version,
        }
    }

    /// Accept a write from `origin`: bump the version and mark every other
    /// replica pending. Returns the nodes that need the new version.
    pub fn apply_write(&mut self, origin: &NodeId, content: Bytes, hash: ContentHash) -> Vec<NodeId> {
        self.version += 1;
        self.content = content;
        self.content_hash = hash;
        self.updated_at = Utc::now();
        self.mark_all_except(origin, false)
    }

    /// Replace the accepted content with the winner's copy at a new version.
    /// Every other replica, divergent ones included, waits for the winner's content.
    pub fn adopt_winner(&mut self, winner: &NodeId) -> Option<Vec<NodeId>> {
        let (content, hash) = self.replica(winner).map(|r| (r.content.clone(), r.hash.clone()))?;
        self.content = content;
        self.content_hash = hash;
        self.conflict = None;
        self.version += 1;
        self.updated_at = Utc::now();
        Some(self.mark_all_except(winner, true))
    }

    fn mark_all_except(&mut self, origin: &NodeId, reset_divergent: bool) -> Vec<NodeId> {
        let version = self.version;
        let content = self.content.clone();
        let hash = self.content_hash.clone();
        let now = self.updated_at;

        let mut targets = Vec::new();
        for replica in &mut self.replicas {
            if &replica.node_id == origin {
                replica.content = content.clone();
                replica.hash = hash.clone();
                replica.version = version;
                replica.updated_at = now;
                replica.status = ReplicaStatus::Current;
            } else {
                if reset_divergent || replica.status != ReplicaStatus::Divergent {
                    replica.status = ReplicaStatus::Pending;
                }
                targets.push(replica.node_id.clone());
            }
        }
        targets
    }

    /// Record content observed on a node that did not arrive through sync.
    /// Returns true when the replica now diverges from the accepted content.
    pub fn record_local_edit(&mut self, node_id: &NodeId, content: Bytes) -> Option<bool> {
        let hash = ContentHash::of(&content);
        let diverged = hash != self.content_hash;
        let version = self.version;
        let replica = self.replica_mut(node_id)?;
        replica.content = content;
        replica.hash = hash;
        replica.updated_at = Utc::now();
        if diverged {
            replica.status = ReplicaStatus::Divergent;
        } else {
            // Edited back to the accepted content.
            replica.status = ReplicaStatus::Current;
            replica.version = version;
        }
        Some(diverged)
    }

    /// Apply a delivered push. Stale pushes (an older version, a replica that
    /// diverged meanwhile, or an artifact that moved on) are ignored.
    pub fn apply_push(&mut self, push: &ReplicaPush) -> bool {
        if push.version != self.version {
            return false;
        }
        match self.replica_mut(&push.node_id) {
            Some(replica) if replica.status == ReplicaStatus::Pending && replica.version < push.version => {
                replica.content = push.content.clone();
                replica.hash = push.hash.clone();
                replica.version = push.version;
                replica.updated_at = Utc::now();
                replica.status = ReplicaStatus::Current;
                true
            }
            _ => false,
        }
    }

    /// Mark a lagging replica pending so it can be caught up.
    pub fn catch_up_push(&mut self, node_id: &NodeId) -> Option<ReplicaPush> {
        let version = self.version;
        let replica = self.replica_mut(node_id)?;
        match replica.status {
            ReplicaStatus::Divergent => None,
            ReplicaStatus::Current if replica.version == version => None,
            _ => {
                replica.status = ReplicaStatus::Pending;
                Some(self.push_for(node_id.clone()))
            }
        }
    }

    /// Compare reachable, settled replicas against the primary node's copy
    /// when that copy is reachable and current, otherwise against the accepted
    /// content. Pending replicas are lagging, not divergent, and are skipped.
    pub fn detect_divergence(&self, reachable: impl Fn(&NodeId) -> bool) -> Option<ConflictRecord> {
        let settled: Vec<&Replica> = self
            .replicas
            .iter()
            .filter(|r| reachable(&r.node_id) && r.status != ReplicaStatus::Pending)
            .collect();

        let reference = settled
            .iter()
            .find(|r| r.node_id == self.primary_node && r.status == ReplicaStatus::Current)
            .map(|r| &r.hash)
            .unwrap_or(&self.content_hash);

        let divergent_nodes: Vec<NodeId> = settled
            .iter()
            .filter(|r| &r.hash != reference)
            .map(|r| r.node_id.clone())
            .collect();

        if divergent_nodes.is_empty() {
            return None;
        }

        Some(ConflictRecord {
            reason: ConflictReason::ReplicaDivergence,
            divergent_nodes,
            hashes: settled.iter().map(|r| (r.node_id.clone(), r.hash.clone())).collect(),
            detected_at: Utc::now(),
        })
    }

    pub fn open_conflict(&mut self, record: ConflictRecord) {
        self.conflict = Some(record);
    }

    pub fn log_access(&mut self, node_id: NodeId, kind: AccessKind) {
        self.access_log.push(AccessRecord {
            node_id,
            kind,
            at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_reachable(_: &NodeId) -> bool {
        true
    }

    fn artifact_with_replicas() -> Artifact {
        let mut artifact = Artifact::new("src/main.rs", Bytes::from_static(b"fn main() {}"), NodeId::from("a"));
        for node in ["b", "c"] {
            let push = artifact.add_pending_replica(NodeId::from(node)).unwrap();
            assert!(artifact.apply_push(&push));
        }
        artifact
    }

    #[test]
    fn test_artifact_id_is_stable_per_path() {
        assert_eq!(ArtifactId::from_path("src/lib.rs"), ArtifactId::from_path("src/lib.rs"));
        assert_ne!(ArtifactId::from_path("src/lib.rs"), ArtifactId::from_path("src/main.rs"));
    }

    #[test]
    fn test_content_hash_is_truncated_sha256() {
        let hash = ContentHash::of(b"hello");
        assert_eq!(hash.as_str(), "2cf24dba5fb0a30e");
    }

    #[test]
    fn test_new_artifact_is_synced() {
        let artifact = artifact_with_replicas();
        assert_eq!(artifact.version(), 1);
        assert_eq!(artifact.replicas().len(), 3);
        assert_eq!(artifact.sync_state(all_reachable), SyncState::Synced);
    }

    #[test]
    fn test_write_marks_others_pending_until_pushed() {
        let mut artifact = artifact_with_replicas();
        let content = Bytes::from_static(b"fn main() { println!(\"hi\"); }");
        let hash = ContentHash::of(&content);
        let targets = artifact.apply_write(&NodeId::from("a"), content, hash);

        assert_eq!(artifact.version(), 2);
        assert_eq!(targets, vec![NodeId::from("b"), NodeId::from("c")]);
        assert_eq!(artifact.sync_state(all_reachable), SyncState::Pending);

        // Offline replicas do not count against the sync state.
        let only_a = |n: &NodeId| n.as_str() == "a";
        assert_eq!(artifact.sync_state(only_a), SyncState::Synced);

        for node in targets {
            let push = artifact.push_for(node);
            assert!(artifact.apply_push(&push));
        }
        assert_eq!(artifact.sync_state(all_reachable), SyncState::Synced);
    }

    #[test]
    fn test_stale_push_is_ignored() {
        let mut artifact = artifact_with_replicas();
        let first = Bytes::from_static(b"v2");
        artifact.apply_write(&NodeId::from("a"), first.clone(), ContentHash::of(&first));
        let stale = artifact.push_for(NodeId::from("b"));

        let second = Bytes::from_static(b"v3");
        artifact.apply_write(&NodeId::from("a"), second.clone(), ContentHash::of(&second));

        assert!(!artifact.apply_push(&stale));
        assert!(artifact.replica_versions_bounded());
    }

    #[test]
    fn test_local_edit_is_detected_as_divergence() {
        let mut artifact = artifact_with_replicas();
        assert_eq!(artifact.record_local_edit(&NodeId::from("b"), Bytes::from_static(b"edited")), Some(true));
        assert_eq!(artifact.record_local_edit(&NodeId::from("z"), Bytes::new()), None);

        let record = artifact.detect_divergence(all_reachable).unwrap();
        assert_eq!(record.reason, ConflictReason::ReplicaDivergence);
        assert_eq!(record.divergent_nodes, vec![NodeId::from("b")]);
        assert_eq!(record.hashes.len(), 3);

        // Unreachable replicas are not compared.
        let without_b = |n: &NodeId| n.as_str() != "b";
        assert!(artifact.detect_divergence(without_b).is_none());
    }

    #[test]
    fn test_divergent_primary_is_named_in_conflict() {
        let mut artifact = artifact_with_replicas();
        assert_eq!(artifact.record_local_edit(&NodeId::from("a"), Bytes::from_static(b"stale")), Some(true));

        let record = artifact.detect_divergence(all_reachable).unwrap();
        assert_eq!(record.divergent_nodes, vec![NodeId::from("a")]);
    }

    #[test]
    fn test_adopt_winner_bumps_version_and_clears_conflict() {
        let mut artifact = artifact_with_replicas();
        artifact.record_local_edit(&NodeId::from("c"), Bytes::from_static(b"winner"));
        let record = artifact.detect_divergence(all_reachable).unwrap();
        artifact.open_conflict(record);
        assert_eq!(artifact.sync_state(all_reachable), SyncState::Conflict);

        let targets = artifact.adopt_winner(&NodeId::from("c")).unwrap();
        assert_eq!(artifact.version(), 2);
        assert_eq!(artifact.content().as_ref(), b"winner");
        assert!(artifact.conflict().is_none());
        assert_eq!(targets.len(), 2);
        assert!(artifact.adopt_winner(&NodeId::from("nope")).is_none());
    }

    #[test]
    fn test_no_reachable_replica_is_diverged() {
        let artifact = artifact_with_replicas();
        assert_eq!(artifact.sync_state(|_: &NodeId| false), SyncState::Diverged);
        assert!(!artifact.has_reachable_replica(|_: &NodeId| false));
    }

    impl Artifact {
        fn replica_versions_bounded(&self) -> bool {
            self.replicas.iter().all(|r| r.version <= self.version)
        }
    }
}
