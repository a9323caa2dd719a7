// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Mesh Node Types
//!
//! Value objects and the node entity tracked by the
//! [`TopologyRegistry`](crate::domain::topology::TopologyRegistry).
//!
//! | Type | Role |
//! |------|------|
//! | [`NodeId`] | stable string identifier chosen by the operator |
//! | [`NodeSpec`] | declarative description used at registration |
//! | [`MeshNode`] | live entity (status, load, hosted artifacts, guardians) |
//! | [`Connection`] | undirected latency/bandwidth edge |
//! | [`NodeProbe`] | one health-probe observation |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::domain::artifact::ArtifactId;
use crate::domain::guardian::GuardianId;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Kind of compute a node offers to the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    /// Developer workstation
    Local,
    /// Edge compute node
    Edge,
    /// Cloud infrastructure
    Cloud,
    /// Quantum optimization backend
    #[serde(alias = "quantum")]
    QuantumBackend,
    /// Local AI model host
    #[serde(alias = "model")]
    ModelHost,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Local => "local",
            NodeType::Edge => "edge",
            NodeType::Cloud => "cloud",
            NodeType::QuantumBackend => "quantum-backend",
            NodeType::ModelHost => "model-host",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Degraded,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Degraded => "degraded",
        }
    }

    /// Whether replicas on a node in this status can be reached at all.
    pub fn is_reachable(&self) -> bool {
        !matches!(self, NodeStatus::Offline)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node description supplied to `initialize_mesh` or read from `spec.nodes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,

    #[serde(rename = "type")]
    pub node_type: NodeType,

    /// Geographic or logical location tag
    #[serde(default = "default_location")]
    pub location: String,

    /// Declared bandwidth in Mbps
    #[serde(default = "default_bandwidth")]
    pub bandwidth_mbps: u32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,

    /// Initial load (0-1)
    #[serde(default)]
    pub load: f64,
}

impl NodeSpec {
    pub fn new(id: impl Into<NodeId>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            node_type,
            location: default_location(),
            bandwidth_mbps: default_bandwidth(),
            capabilities: Vec::new(),
            load: 0.0,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    pub fn with_load(mut self, load: f64) -> Self {
        self.load = load;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// A node registered in the mesh.
///
/// Nodes are never removed from the registry; [`MeshNode::decommissioned`]
/// marks a soft removal so replicas and guardians can keep referencing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshNode {
    pub id: NodeId,
    pub node_type: NodeType,
    pub location: String,
    pub status: NodeStatus,
    pub load: f64,
    pub hosted_artifacts: BTreeSet<ArtifactId>,
    pub guardians: BTreeSet<GuardianId>,
    pub bandwidth_mbps: u32,
    pub capabilities: Vec<String>,
    pub decommissioned: bool,
    pub registered_at: DateTime<Utc>,
    pub last_status_change: DateTime<Utc>,
}

impl MeshNode {
    pub fn from_spec(spec: NodeSpec) -> Self {
        let now = Utc::now();
        Self {
            id: spec.id,
            node_type: spec.node_type,
            location: spec.location,
            status: NodeStatus::Online,
            load: spec.load.clamp(0.0, 1.0),
            hosted_artifacts: BTreeSet::new(),
            guardians: BTreeSet::new(),
            bandwidth_mbps: spec.bandwidth_mbps,
            capabilities: spec.capabilities,
            decommissioned: false,
            registered_at: now,
            last_status_change: now,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.status.is_reachable()
    }

    /// Whether the node can accept execution work or new replicas.
    pub fn is_available(&self, max_load: f64) -> bool {
        self.status == NodeStatus::Online && self.load < max_load
    }

    pub(crate) fn set_status(&mut self, status: NodeStatus) -> bool {
        if self.status == status {
            return false;
        }
        self.status = status;
        self.last_status_change = Utc::now();
        true
    }
}

/// Undirected edge between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub a: NodeId,
    pub b: NodeId,
    pub latency_ms: u64,
    #[serde(default = "default_bandwidth")]
    pub bandwidth_mbps: u32,
}

impl Connection {
    pub fn new(a: impl Into<NodeId>, b: impl Into<NodeId>, latency_ms: u64, bandwidth_mbps: u32) -> Self {
        Self {
            a: a.into(),
            b: b.into(),
            latency_ms,
            bandwidth_mbps,
        }
    }

    /// Order-independent key so `a-b` and `b-a` address the same edge.
    pub fn key(&self) -> (NodeId, NodeId) {
        edge_key(&self.a, &self.b)
    }

    pub fn other(&self, id: &NodeId) -> Option<&NodeId> {
        if &self.a == id {
            Some(&self.b)
        } else if &self.b == id {
            Some(&self.a)
        } else {
            None
        }
    }
}

pub(crate) fn edge_key(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Observation returned by a health probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeProbe {
    pub reachable: bool,
    pub load: f64,
}

impl NodeProbe {
    pub fn healthy(load: f64) -> Self {
        Self { reachable: true, load }
    }

    pub fn unreachable() -> Self {
        Self { reachable: false, load: 0.0 }
    }
}

fn default_location() -> String {
    "unknown".to_string()
}

fn default_bandwidth() -> u32 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_type_aliases() {
        let quantum: NodeType = serde_yaml::from_str("quantum").unwrap();
        let backend: NodeType = serde_yaml::from_str("quantum-backend").unwrap();
        let model: NodeType = serde_yaml::from_str("model").unwrap();

        assert_eq!(quantum, NodeType::QuantumBackend);
        assert_eq!(backend, NodeType::QuantumBackend);
        assert_eq!(model, NodeType::ModelHost);
    }

    #[test]
    fn test_availability_respects_load() {
        let mut node = MeshNode::from_spec(NodeSpec::new("edge-1", NodeType::Edge).with_load(0.95));
        assert!(node.is_reachable());
        assert!(!node.is_available(0.9));

        node.load = 0.2;
        assert!(node.is_available(0.9));

        node.set_status(NodeStatus::Degraded);
        assert!(node.is_reachable());
        assert!(!node.is_available(0.9));
    }

    #[test]
    fn test_connection_key_is_symmetric() {
        let ab = Connection::new("a", "b", 10, 100);
        let ba = Connection::new("b", "a", 10, 100);
        assert_eq!(ab.key(), ba.key());
        assert_eq!(ab.other(&NodeId::from("a")), Some(&NodeId::from("b")));
        assert_eq!(ab.other(&NodeId::from("c")), None);
    }
}
