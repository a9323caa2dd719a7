// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::domain::artifact::ReplicaPush;
use crate::domain::node::{MeshNode, NodeId, NodeProbe};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum BackendError {
    #[error("Execution failed on {node}: {reason}")]
    ExecutionFailed { node: NodeId, reason: String },
    #[error("Node {0} does not support this workload")]
    Unsupported(NodeId),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Node {0} is unreachable")]
    Unreachable(NodeId),
    #[error("Push to {node} rejected: {reason}")]
    Rejected { node: NodeId, reason: String },
    #[error("Probe of {node} failed: {reason}")]
    ProbeFailed { node: NodeId, reason: String },
}

/// Runs artifact content on a node and returns its textual output.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    async fn run(&self, content: &Bytes, node: &MeshNode) -> Result<String, BackendError>;
}

/// Delivers replica content to a node.
#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    async fn push(&self, push: &ReplicaPush) -> Result<(), TransportError>;
}

/// Reports liveness and load of a node.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, node: &MeshNode) -> Result<NodeProbe, TransportError>;
}
