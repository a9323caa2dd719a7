// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Topology Registry
//!
//! Bookkeeping for mesh nodes and the latency-weighted connections between
//! them. The registry is a leaf: it never calls into replication, guardians
//! or the router.
//!
//! - Routing uses Dijkstra over connection latencies. Offline nodes are never
//!   traversed and an offline endpoint has no route.
//! - Nodes are never removed; decommissioning is a soft, permanent offline.
//! - Health figures are computed on demand from the current node set.

use metrics::gauge;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::domain::artifact::ArtifactId;
use crate::domain::error::{MeshError, MeshResult};
use crate::domain::guardian::GuardianId;
use crate::domain::node::{edge_key, Connection, MeshNode, NodeId, NodeProbe, NodeSpec, NodeStatus, NodeType};

/// Lowest-latency path between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub nodes: Vec<NodeId>,
    pub total_latency_ms: u64,
}

impl Route {
    pub fn hops(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkHealth {
    pub online_nodes: usize,
    pub degraded_nodes: usize,
    pub total_nodes: usize,
    /// Share of registered nodes that are online
    pub availability: f64,
    pub avg_latency_ms: f64,
    pub avg_load: f64,
    pub topology_edges: usize,
}

/// Status change produced by a probe or an explicit mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub from: NodeStatus,
    pub to: NodeStatus,
}

#[derive(Default)]
struct TopologyState {
    nodes: HashMap<NodeId, MeshNode>,
    edges: BTreeMap<(NodeId, NodeId), Connection>,
    adjacency: HashMap<NodeId, BTreeMap<NodeId, u64>>,
}

impl TopologyState {
    fn node(&self, id: &NodeId) -> MeshResult<&MeshNode> {
        self.nodes.get(id).ok_or_else(|| MeshError::UnknownNode(id.clone()))
    }

    fn node_mut(&mut self, id: &NodeId) -> MeshResult<&mut MeshNode> {
        self.nodes.get_mut(id).ok_or_else(|| MeshError::UnknownNode(id.clone()))
    }

    fn traversable(&self, id: &NodeId) -> bool {
        self.nodes.get(id).map(MeshNode::is_reachable).unwrap_or(false)
    }

    /// Dijkstra from `source`; returns distances and predecessors.
    fn dijkstra(&self, source: &NodeId) -> (HashMap<NodeId, u64>, HashMap<NodeId, NodeId>) {
        let mut dist: HashMap<NodeId, u64> = HashMap::new();
        let mut prev: HashMap<NodeId, NodeId> = HashMap::new();
        let mut heap = BinaryHeap::new();

        dist.insert(source.clone(), 0);
        heap.push(Reverse((0u64, source.clone())));

        while let Some(Reverse((cost, node))) = heap.pop() {
            if dist.get(&node).is_some_and(|best| cost > *best) {
                continue;
            }
            let Some(neighbours) = self.adjacency.get(&node) else {
                continue;
            };
            for (next, latency) in neighbours {
                if !self.traversable(next) {
                    continue;
                }
                let candidate = cost.saturating_add(*latency);
                let improved = dist.get(next).is_none_or(|best| candidate < *best);
                if improved {
                    dist.insert(next.clone(), candidate);
                    prev.insert(next.clone(), node.clone());
                    heap.push(Reverse((candidate, next.clone())));
                }
            }
        }

        (dist, prev)
    }

    fn online_count(&self) -> usize {
        self.nodes.values().filter(|n| n.status == NodeStatus::Online).count()
    }
}

pub struct TopologyRegistry {
    state: RwLock<TopologyState>,
    max_load: f64,
    degraded_load: f64,
}

impl TopologyRegistry {
    /// `max_load` bounds availability; probes at or above `degraded_load` degrade a node.
    pub fn new(max_load: f64, degraded_load: f64) -> Self {
        Self {
            state: RwLock::new(TopologyState::default()),
            max_load,
            degraded_load,
        }
    }

    pub fn max_load(&self) -> f64 {
        self.max_load
    }

    pub fn register_node(&self, spec: NodeSpec) -> MeshResult<MeshNode> {
        let mut state = self.state.write();
        if state.nodes.contains_key(&spec.id) {
            return Err(MeshError::DuplicateNode(spec.id));
        }

        let node = MeshNode::from_spec(spec);
        info!(node = %node.id, node_type = %node.node_type, location = %node.location, "Registered mesh node");
        state.adjacency.entry(node.id.clone()).or_default();
        state.nodes.insert(node.id.clone(), node.clone());
        gauge!("codemesh_nodes_online").set(state.online_count() as f64);
        Ok(node)
    }

    /// Add or update the undirected connection between `a` and `b`.
    /// Returns `true` when the connection is new.
    pub fn connect(&self, a: &NodeId, b: &NodeId, latency_ms: u64, bandwidth_mbps: u32) -> MeshResult<bool> {
        if a == b {
            return Err(MeshError::InvalidConnection {
                a: a.clone(),
                b: b.clone(),
                reason: "a node cannot connect to itself".to_string(),
            });
        }

        let mut state = self.state.write();
        state.node(a)?;
        state.node(b)?;

        let connection = Connection::new(a.clone(), b.clone(), latency_ms, bandwidth_mbps);
        let created = state.edges.insert(connection.key(), connection).is_none();
        state.adjacency.entry(a.clone()).or_default().insert(b.clone(), latency_ms);
        state.adjacency.entry(b.clone()).or_default().insert(a.clone(), latency_ms);

        debug!(%a, %b, latency_ms, bandwidth_mbps, created, "Connected nodes");
        Ok(created)
    }

    pub fn connection(&self, a: &NodeId, b: &NodeId) -> Option<Connection> {
        self.state.read().edges.get(&edge_key(a, b)).cloned()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.state.read().edges.values().cloned().collect()
    }

    pub fn shortest_path(&self, from: &NodeId, to: &NodeId) -> MeshResult<Route> {
        let state = self.state.read();
        let source = state.node(from)?;
        let target = state.node(to)?;

        if from == to {
            return Ok(Route {
                nodes: vec![from.clone()],
                total_latency_ms: 0,
            });
        }

        let no_path = || MeshError::NoPath {
            from: from.clone(),
            to: to.clone(),
        };
        if !source.is_reachable() || !target.is_reachable() {
            return Err(no_path());
        }

        let (dist, prev) = state.dijkstra(from);
        let total_latency_ms = *dist.get(to).ok_or_else(no_path)?;

        let mut nodes = vec![to.clone()];
        let mut cursor = to;
        while let Some(step) = prev.get(cursor) {
            nodes.push(step.clone());
            cursor = step;
        }
        nodes.reverse();

        Ok(Route { nodes, total_latency_ms })
    }

    /// Path latency from `source` to every node it can reach.
    pub fn distances_from(&self, source: &NodeId) -> HashMap<NodeId, u64> {
        let state = self.state.read();
        if !state.nodes.contains_key(source) {
            return HashMap::new();
        }
        state.dijkstra(source).0
    }

    pub fn health(&self) -> NetworkHealth {
        let state = self.state.read();
        let active: Vec<&MeshNode> = state.nodes.values().filter(|n| !n.decommissioned).collect();

        let total_nodes = active.len();
        let online_nodes = active.iter().filter(|n| n.status == NodeStatus::Online).count();
        let degraded_nodes = active.iter().filter(|n| n.status == NodeStatus::Degraded).count();
        let topology_edges = state.edges.len();

        let mean = |sum: f64, count: usize| if count == 0 { 0.0 } else { sum / count as f64 };

        NetworkHealth {
            online_nodes,
            degraded_nodes,
            total_nodes,
            availability: mean(online_nodes as f64, total_nodes),
            avg_latency_ms: mean(
                state.edges.values().map(|c| c.latency_ms as f64).sum(),
                topology_edges,
            ),
            avg_load: mean(active.iter().map(|n| n.load).sum(), total_nodes),
            topology_edges,
        }
    }

    fn set_status(&self, id: &NodeId, status: NodeStatus) -> MeshResult<Option<StatusChange>> {
        self.update_status(id, |_| Ok(Some(status)))
    }

    /// Decide the next status and write it under a single write lock, so a
    /// concurrent decommission cannot slip between the check and the write.
    fn update_status(
        &self,
        id: &NodeId,
        decide: impl FnOnce(&mut MeshNode) -> MeshResult<Option<NodeStatus>>,
    ) -> MeshResult<Option<StatusChange>> {
        let mut state = self.state.write();
        let node = state.node_mut(id)?;
        let from = node.status;
        let Some(status) = decide(&mut *node)? else {
            return Ok(None);
        };
        if !node.set_status(status) {
            return Ok(None);
        }
        info!(node = %id, %from, to = %status, "Node status changed");
        gauge!("codemesh_nodes_online").set(state.online_count() as f64);
        Ok(Some(StatusChange { from, to: status }))
    }

    pub fn mark_unavailable(&self, id: &NodeId) -> MeshResult<Option<StatusChange>> {
        self.set_status(id, NodeStatus::Offline)
    }

    pub fn mark_available(&self, id: &NodeId) -> MeshResult<Option<StatusChange>> {
        self.update_status(id, |node| {
            if node.decommissioned {
                return Err(MeshError::NodeDecommissioned(id.clone()));
            }
            Ok(Some(NodeStatus::Online))
        })
    }

    pub fn set_load(&self, id: &NodeId, load: f64) -> MeshResult<()> {
        let mut state = self.state.write();
        state.node_mut(id)?.load = load.clamp(0.0, 1.0);
        Ok(())
    }

    /// Fold a probe observation into the node's status and load.
    pub fn apply_probe(&self, id: &NodeId, probe: NodeProbe) -> MeshResult<Option<StatusChange>> {
        let degraded_load = self.degraded_load;
        self.update_status(id, |node| {
            if node.decommissioned {
                debug!(node = %id, "Ignoring probe for decommissioned node");
                return Ok(None);
            }
            let status = if !probe.reachable {
                NodeStatus::Offline
            } else {
                node.load = probe.load.clamp(0.0, 1.0);
                if probe.load >= degraded_load {
                    NodeStatus::Degraded
                } else {
                    NodeStatus::Online
                }
            };
            Ok(Some(status))
        })
    }

    /// Permanently take a node out of service.
    pub fn decommission(&self, id: &NodeId) -> MeshResult<Option<StatusChange>> {
        self.update_status(id, |node| {
            if node.decommissioned {
                return Ok(None);
            }
            warn!(node = %id, "Decommissioning node");
            node.decommissioned = true;
            Ok(Some(NodeStatus::Offline))
        })
    }

    /// Pick up to `count` nodes for new replicas: available nodes other than
    /// `primary`, least loaded first, then nearest to `primary`, then by id.
    pub fn select_replica_targets(&self, primary: &NodeId, count: usize) -> Vec<NodeId> {
        if count == 0 {
            return Vec::new();
        }
        let distances = self.distances_from(primary);
        let state = self.state.read();

        let mut candidates: Vec<&MeshNode> = state
            .nodes
            .values()
            .filter(|n| &n.id != primary && !n.decommissioned && n.is_available(self.max_load))
            .collect();

        candidates.sort_by(|a, b| {
            a.load
                .total_cmp(&b.load)
                .then_with(|| compare_latency(distances.get(&a.id), distances.get(&b.id)))
                .then_with(|| a.id.cmp(&b.id))
        });

        candidates.into_iter().take(count).map(|n| n.id.clone()).collect()
    }

    pub fn get(&self, id: &NodeId) -> MeshResult<MeshNode> {
        self.state.read().node(id).cloned()
    }

    pub fn ensure_exists(&self, id: &NodeId) -> MeshResult<()> {
        self.state.read().node(id).map(|_| ())
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.state.read().nodes.contains_key(id)
    }

    pub fn list(&self) -> Vec<MeshNode> {
        let mut nodes: Vec<MeshNode> = self.state.read().nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn nodes_of_type(&self, node_type: NodeType) -> Vec<MeshNode> {
        self.list().into_iter().filter(|n| n.node_type == node_type).collect()
    }

    pub fn is_reachable(&self, id: &NodeId) -> bool {
        self.state.read().traversable(id)
    }

    pub fn is_available(&self, id: &NodeId) -> bool {
        self.state
            .read()
            .nodes
            .get(id)
            .is_some_and(|n| n.is_available(self.max_load))
    }

    /// Snapshot of reachable node ids, for evaluating many replicas at once.
    pub fn reachable_set(&self) -> HashSet<NodeId> {
        self.state
            .read()
            .nodes
            .values()
            .filter(|n| n.is_reachable())
            .map(|n| n.id.clone())
            .collect()
    }

    pub fn record_hosting(&self, id: &NodeId, artifact_id: ArtifactId) {
        if let Some(node) = self.state.write().nodes.get_mut(id) {
            node.hosted_artifacts.insert(artifact_id);
        }
    }

    pub fn release_hosting(&self, id: &NodeId, artifact_id: &ArtifactId) {
        if let Some(node) = self.state.write().nodes.get_mut(id) {
            node.hosted_artifacts.remove(artifact_id);
        }
    }

    pub fn record_guardian(&self, id: &NodeId, guardian_id: GuardianId) {
        if let Some(node) = self.state.write().nodes.get_mut(id) {
            node.guardians.insert(guardian_id);
        }
    }

    pub fn release_guardian(&self, id: &NodeId, guardian_id: &GuardianId) {
        if let Some(node) = self.state.write().nodes.get_mut(id) {
            node.guardians.remove(guardian_id);
        }
    }
}

/// Known latencies sort before unknown ones.
pub(crate) fn compare_latency(a: Option<&u64>, b: Option<&u64>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
