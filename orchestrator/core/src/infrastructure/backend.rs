// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Digest Execution Backend
//
// Deterministic backend for local meshes and tests: "running" an artifact
// yields a digest of its content, so every node holding the same version
// produces the same output.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;

use crate::domain::artifact::ContentHash;
use crate::domain::node::{MeshNode, NodeType};
use crate::domain::runtime::{BackendError, ExecutionBackend};

#[derive(Debug, Clone, Default)]
pub struct DigestBackend {
    latency: HashMap<NodeType, Duration>,
}

impl DigestBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated run time for nodes of a type.
    pub fn with_latency(mut self, node_type: NodeType, latency: Duration) -> Self {
        self.latency.insert(node_type, latency);
        self
    }

    pub fn output_for(content: &[u8]) -> String {
        format!("digest:{} bytes:{}", ContentHash::of(content), content.len())
    }
}

#[async_trait]
impl ExecutionBackend for DigestBackend {
    async fn run(&self, content: &Bytes, node: &MeshNode) -> Result<String, BackendError> {
        if let Some(latency) = self.latency.get(&node.node_type) {
            tokio::time::sleep(*latency).await;
        }
        Ok(Self::output_for(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::NodeSpec;

    #[tokio::test]
    async fn test_output_is_node_independent() {
        let backend = DigestBackend::new().with_latency(NodeType::Cloud, Duration::from_millis(1));
        let content = Bytes::from_static(b"print('hi')");

        let local = MeshNode::from_spec(NodeSpec::new("laptop", NodeType::Local));
        let cloud = MeshNode::from_spec(NodeSpec::new("vm", NodeType::Cloud));

        let a = backend.run(&content, &local).await.unwrap();
        let b = backend.run(&content, &cloud).await.unwrap();
        assert_eq!(a, b);
        assert!(a.ends_with("bytes:11"));
    }
}
