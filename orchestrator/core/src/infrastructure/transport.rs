// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// In-Memory Mesh Network
//
// Process-local stand-in for the wire between nodes. Replica pushes are
// stored per node, partitions make a node unreachable for pushes and
// probes, and an optional delay simulates transfer time.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

use crate::domain::artifact::{ArtifactId, ContentHash, ReplicaPush};
use crate::domain::node::{MeshNode, NodeId, NodeProbe};
use crate::domain::runtime::{HealthProbe, ReplicaTransport, TransportError};

/// One push accepted by the network.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub artifact_id: ArtifactId,
    pub node_id: NodeId,
    pub version: u64,
    pub hash: ContentHash,
    pub delivered_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryNetwork {
    partitioned: RwLock<HashSet<NodeId>>,
    loads: RwLock<HashMap<NodeId, f64>>,
    stored: RwLock<HashMap<(NodeId, ArtifactId), (u64, Bytes)>>,
    deliveries: RwLock<Vec<Delivery>>,
    delay: Option<Duration>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every push waits `delay` before it is accepted.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn partition(&self, node_id: &NodeId) {
        self.partitioned.write().insert(node_id.clone());
    }

    pub fn heal(&self, node_id: &NodeId) {
        self.partitioned.write().remove(node_id);
    }

    pub fn is_partitioned(&self, node_id: &NodeId) -> bool {
        self.partitioned.read().contains(node_id)
    }

    /// Load reported by probes instead of the registry's value.
    pub fn set_load(&self, node_id: &NodeId, load: f64) {
        self.loads.write().insert(node_id.clone(), load);
    }

    /// Latest content delivered to `node_id` for an artifact.
    pub fn stored(&self, node_id: &NodeId, artifact_id: &ArtifactId) -> Option<(u64, Bytes)> {
        self.stored.read().get(&(node_id.clone(), *artifact_id)).cloned()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.read().clone()
    }
}

#[async_trait]
impl ReplicaTransport for InMemoryNetwork {
    async fn push(&self, push: &ReplicaPush) -> Result<(), TransportError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.is_partitioned(&push.node_id) {
            return Err(TransportError::Unreachable(push.node_id.clone()));
        }

        self.stored.write().insert(
            (push.node_id.clone(), push.artifact_id),
            (push.version, push.content.clone()),
        );
        self.deliveries.write().push(Delivery {
            artifact_id: push.artifact_id,
            node_id: push.node_id.clone(),
            version: push.version,
            hash: push.hash.clone(),
            delivered_at: Utc::now(),
        });
        debug!(node = %push.node_id, artifact_id = %push.artifact_id, version = push.version, "Delivered replica");
        Ok(())
    }
}

#[async_trait]
impl HealthProbe for InMemoryNetwork {
    async fn probe(&self, node: &MeshNode) -> Result<NodeProbe, TransportError> {
        if self.is_partitioned(&node.id) {
            return Ok(NodeProbe::unreachable());
        }
        let load = self.loads.read().get(&node.id).copied().unwrap_or(node.load);
        Ok(NodeProbe::healthy(load))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::{NodeSpec, NodeType};

    fn push(node: &str) -> ReplicaPush {
        let content = Bytes::from_static(b"fn main() {}");
        ReplicaPush {
            artifact_id: ArtifactId::from_path("main.rs"),
            node_id: NodeId::from(node),
            hash: ContentHash::of(&content),
            content,
            version: 3,
        }
    }

    #[tokio::test]
    async fn test_push_is_stored() {
        let network = InMemoryNetwork::new();
        network.push(&push("edge-1")).await.unwrap();

        let (version, content) = network
            .stored(&NodeId::from("edge-1"), &ArtifactId::from_path("main.rs"))
            .unwrap();
        assert_eq!(version, 3);
        assert_eq!(content.as_ref(), b"fn main() {}");
        assert_eq!(network.deliveries().len(), 1);
    }

    #[tokio::test]
    async fn test_partition_blocks_push_and_probe() {
        let network = InMemoryNetwork::new();
        let node = MeshNode::from_spec(NodeSpec::new("edge-1", NodeType::Edge).with_load(0.4));
        network.partition(&node.id);

        assert_eq!(
            network.push(&push("edge-1")).await,
            Err(TransportError::Unreachable(NodeId::from("edge-1")))
        );
        assert_eq!(network.probe(&node).await.unwrap(), NodeProbe::unreachable());

        network.heal(&node.id);
        assert_eq!(network.probe(&node).await.unwrap(), NodeProbe::healthy(0.4));
        network.set_load(&node.id, 0.8);
        assert_eq!(network.probe(&node).await.unwrap().load, 0.8);
    }
}
