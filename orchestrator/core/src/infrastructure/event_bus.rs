// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus - Pub/Sub for Mesh Events
//
// In-memory fan-out over a tokio broadcast channel. Slow subscribers lag and
// lose events; publishers never block.

use crate::domain::artifact::ArtifactId;
use crate::domain::events::{ExecutionEvent, GuardianEvent, ReplicationEvent, TopologyEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Unified event type carried by the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshEvent {
    Topology(TopologyEvent),
    Replication(ReplicationEvent),
    Guardian(GuardianEvent),
    Execution(ExecutionEvent),
}

impl MeshEvent {
    /// Artifact the event concerns. Topology events concern none.
    pub fn artifact_id(&self) -> Option<ArtifactId> {
        match self {
            MeshEvent::Topology(_) => None,
            MeshEvent::Replication(e) => Some(e.artifact_id()),
            MeshEvent::Guardian(e) => Some(e.artifact_id()),
            MeshEvent::Execution(e) => Some(e.artifact_id()),
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<MeshEvent>>,
}

impl EventBus {
    /// Capacity is the number of events buffered per subscriber before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_topology_event(&self, event: TopologyEvent) {
        self.publish(MeshEvent::Topology(event));
    }

    pub fn publish_replication_event(&self, event: ReplicationEvent) {
        self.publish(MeshEvent::Replication(event));
    }

    pub fn publish_guardian_event(&self, event: GuardianEvent) {
        self.publish(MeshEvent::Guardian(event));
    }

    pub fn publish_execution_event(&self, event: ExecutionEvent) {
        self.publish(MeshEvent::Execution(event));
    }

    fn publish(&self, event: MeshEvent) {
        debug!("Publishing event: {:?}", event);

        // send() only fails when nobody is subscribed
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to events concerning one artifact
    pub fn subscribe_artifact(&self, artifact_id: ArtifactId) -> ArtifactEventReceiver {
        ArtifactEventReceiver {
            receiver: self.sender.subscribe(),
            artifact_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<MeshEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<MeshEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    pub fn try_recv(&mut self) -> Result<MeshEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to a single artifact
pub struct ArtifactEventReceiver {
    receiver: broadcast::Receiver<MeshEvent>,
    artifact_id: ArtifactId,
}

impl ArtifactEventReceiver {
    pub async fn recv(&mut self) -> Result<MeshEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.artifact_id() == Some(self.artifact_id) {
                return Ok(event);
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::{NodeId, NodeType};
    use chrono::Utc;

    fn removed(artifact_id: ArtifactId) -> ReplicationEvent {
        ReplicationEvent::ArtifactRemoved {
            artifact_id,
            removed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.publish_topology_event(TopologyEvent::NodeRegistered {
            node_id: NodeId::from("edge-1"),
            node_type: NodeType::Edge,
            registered_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            MeshEvent::Topology(TopologyEvent::NodeRegistered { node_id, .. }) => {
                assert_eq!(node_id, NodeId::from("edge-1"));
            }
            other => panic!("Wrong event type received: {other:?}"),
        }
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
    }

    #[tokio::test]
    async fn test_artifact_event_filtering() {
        let event_bus = EventBus::new(10);
        let watched = ArtifactId::from_path("watched.rs");
        let other = ArtifactId::from_path("other.rs");
        let mut receiver = event_bus.subscribe_artifact(watched);

        event_bus.publish_replication_event(removed(other));
        event_bus.publish_topology_event(TopologyEvent::NodesConnected {
            a: NodeId::from("a"),
            b: NodeId::from("b"),
            latency_ms: 5,
        });
        event_bus.publish_replication_event(removed(watched));

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.artifact_id(), Some(watched));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let event_bus = EventBus::default();
        event_bus.publish_replication_event(removed(ArtifactId::from_path("x")));
        assert_eq!(event_bus.subscriber_count(), 0);
    }
}
