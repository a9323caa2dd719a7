// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Errors raised by the mesh domain and application services.

use thiserror::Error;

use crate::domain::artifact::ArtifactId;
use crate::domain::execution::ExecutionContext;
use crate::domain::guardian::{GuardianId, GuardianState};
use crate::domain::node::{NodeId, NodeStatus};

pub type MeshResult<T> = Result<T, MeshError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum MeshError {
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("node already registered: {0}")]
    DuplicateNode(NodeId),

    #[error("invalid connection {a} <-> {b}: {reason}")]
    InvalidConnection { a: NodeId, b: NodeId, reason: String },

    #[error("no path from {from} to {to}")]
    NoPath { from: NodeId, to: NodeId },

    #[error("node {node_id} is unavailable (status: {status})")]
    NodeUnavailable { node_id: NodeId, status: NodeStatus },

    #[error("node {0} has been decommissioned")]
    NodeDecommissioned(NodeId),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(ArtifactId),

    #[error("artifact {artifact_id} already registered for path {path}")]
    DuplicateArtifact { artifact_id: ArtifactId, path: String },

    #[error("artifact {artifact_id} has no replica on node {node_id}")]
    ReplicaNotFound { artifact_id: ArtifactId, node_id: NodeId },

    #[error("artifact {artifact_id} has no reachable replica ({total} known)")]
    InsufficientReplicas { artifact_id: ArtifactId, total: usize },

    #[error("artifact {artifact_id} has an unresolved conflict between [{}]", join_nodes(.divergent_nodes))]
    ConflictUnresolved {
        artifact_id: ArtifactId,
        divergent_nodes: Vec<NodeId>,
    },

    #[error("no eligible node to execute artifact {artifact_id} in {context} context: {reason}")]
    NoEligibleNode {
        artifact_id: ArtifactId,
        context: ExecutionContext,
        reason: String,
    },

    #[error("execution of artifact {artifact_id} on {node_id} timed out after {timeout_ms}ms")]
    Timeout {
        artifact_id: ArtifactId,
        node_id: NodeId,
        timeout_ms: u64,
    },

    #[error("artifact {artifact_id} already has primary guardian {guardian_id}")]
    PrimaryGuardianExists {
        artifact_id: ArtifactId,
        guardian_id: GuardianId,
    },

    #[error("artifact {0} has no secondary guardian eligible for promotion")]
    NoSecondaryGuardian(ArtifactId),

    #[error("guardian not found: {0}")]
    GuardianNotFound(GuardianId),

    #[error("guardian {guardian_id} cannot move from {from} to {to}")]
    InvalidGuardianTransition {
        guardian_id: GuardianId,
        from: GuardianState,
        to: GuardianState,
    },
}

impl MeshError {
    /// Artifact the error is scoped to, if any.
    pub fn artifact_id(&self) -> Option<ArtifactId> {
        match self {
            MeshError::ArtifactNotFound(id) | MeshError::NoSecondaryGuardian(id) => Some(*id),
            MeshError::DuplicateArtifact { artifact_id, .. }
            | MeshError::ReplicaNotFound { artifact_id, .. }
            | MeshError::InsufficientReplicas { artifact_id, .. }
            | MeshError::ConflictUnresolved { artifact_id, .. }
            | MeshError::NoEligibleNode { artifact_id, .. }
            | MeshError::Timeout { artifact_id, .. }
            | MeshError::PrimaryGuardianExists { artifact_id, .. } => Some(*artifact_id),
            _ => None,
        }
    }
}

fn join_nodes(nodes: &[NodeId]) -> String {
    nodes.iter().map(NodeId::as_str).collect::<Vec<_>>().join(", ")
}
