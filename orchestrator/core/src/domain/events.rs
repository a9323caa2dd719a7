// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::artifact::{ArtifactId, ConflictReason, ContentHash};
use crate::domain::execution::{ExecutionContext, ExecutionStatus, PlanId};
use crate::domain::guardian::{GuardianId, GuardianState};
use crate::domain::node::{NodeId, NodeStatus, NodeType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TopologyEvent {
    NodeRegistered {
        node_id: NodeId,
        node_type: NodeType,
        registered_at: DateTime<Utc>,
    },
    NodesConnected {
        a: NodeId,
        b: NodeId,
        latency_ms: u64,
    },
    NodeStatusChanged {
        node_id: NodeId,
        from: NodeStatus,
        to: NodeStatus,
        changed_at: DateTime<Utc>,
    },
    NodeDecommissioned {
        node_id: NodeId,
        decommissioned_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicationEvent {
    ArtifactAdded {
        artifact_id: ArtifactId,
        path: String,
        primary_node: NodeId,
        replicas: Vec<NodeId>,
        added_at: DateTime<Utc>,
    },
    ArtifactSynced {
        artifact_id: ArtifactId,
        origin: NodeId,
        version: u64,
        hash: ContentHash,
        synced_at: DateTime<Utc>,
    },
    ReplicaUpdated {
        artifact_id: ArtifactId,
        node_id: NodeId,
        version: u64,
    },
    ConflictDetected {
        artifact_id: ArtifactId,
        reason: ConflictReason,
        divergent_nodes: Vec<NodeId>,
        detected_at: DateTime<Utc>,
    },
    ConflictResolved {
        artifact_id: ArtifactId,
        winner: NodeId,
        version: u64,
        resolved_at: DateTime<Utc>,
    },
    PrimaryReassigned {
        artifact_id: ArtifactId,
        from: NodeId,
        to: NodeId,
    },
    ArtifactRemoved {
        artifact_id: ArtifactId,
        removed_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GuardianEvent {
    GuardianSpawned {
        guardian_id: GuardianId,
        artifact_id: ArtifactId,
        node_id: NodeId,
        is_primary: bool,
    },
    GuardianStateChanged {
        guardian_id: GuardianId,
        artifact_id: ArtifactId,
        to: GuardianState,
    },
    GuardianPromoted {
        guardian_id: GuardianId,
        artifact_id: ArtifactId,
        node_id: NodeId,
        promoted_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionEvent {
    ExecutionPlanned {
        plan_id: PlanId,
        artifact_id: ArtifactId,
        context: ExecutionContext,
        primary_node: NodeId,
    },
    ExecutionFinished {
        plan_id: PlanId,
        artifact_id: ArtifactId,
        status: ExecutionStatus,
        served_by: Option<NodeId>,
        finished_at: DateTime<Utc>,
    },
    ExecutionFailed {
        plan_id: PlanId,
        artifact_id: ArtifactId,
        reason: String,
        failed_at: DateTime<Utc>,
    },
}

impl ReplicationEvent {
    pub fn artifact_id(&self) -> ArtifactId {
        match self {
            ReplicationEvent::ArtifactAdded { artifact_id, .. }
            | ReplicationEvent::ArtifactSynced { artifact_id, .. }
            | ReplicationEvent::ReplicaUpdated { artifact_id, .. }
            | ReplicationEvent::ConflictDetected { artifact_id, .. }
            | ReplicationEvent::ConflictResolved { artifact_id, .. }
            | ReplicationEvent::PrimaryReassigned { artifact_id, .. }
            | ReplicationEvent::ArtifactRemoved { artifact_id, .. } => *artifact_id,
        }
    }
}

impl GuardianEvent {
    pub fn artifact_id(&self) -> ArtifactId {
        match self {
            GuardianEvent::GuardianSpawned { artifact_id, .. }
            | GuardianEvent::GuardianStateChanged { artifact_id, .. }
            | GuardianEvent::GuardianPromoted { artifact_id, .. } => *artifact_id,
        }
    }
}

impl ExecutionEvent {
    pub fn artifact_id(&self) -> ArtifactId {
        match self {
            ExecutionEvent::ExecutionPlanned { artifact_id, .. }
            | ExecutionEvent::ExecutionFinished { artifact_id, .. }
            | ExecutionEvent::ExecutionFailed { artifact_id, .. } => *artifact_id,
        }
    }
}
