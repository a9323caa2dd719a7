// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Guardian Agent System
//!
//! Registry of [`GuardianAgent`]s. Each artifact has one primary guardian on
//! its primary node and one secondary per additional replica. The system only
//! drives guardian state; it never reads or writes artifact content.

use chrono::Utc;
use metrics::counter;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::artifact::{ArtifactId, ContentHash};
use crate::domain::error::{MeshError, MeshResult};
use crate::domain::events::GuardianEvent;
use crate::domain::guardian::{GuardianAgent, GuardianId, GuardianState};
use crate::domain::node::NodeId;
use crate::domain::topology::{compare_latency, TopologyRegistry};
use crate::infrastructure::event_bus::EventBus;

/// What was retired, so the caller can decide whether to promote.
#[derive(Debug, Clone, PartialEq)]
pub struct Retirement {
    pub guardian_id: GuardianId,
    pub artifact_id: ArtifactId,
    pub node_id: NodeId,
    pub was_primary: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardianReport {
    pub artifact_id: ArtifactId,
    pub primary: Option<GuardianAgent>,
    pub secondaries: Vec<GuardianAgent>,
    pub active: usize,
    pub degraded: usize,
    pub retired: usize,
    pub changes_detected: u64,
}

#[derive(Default)]
struct Registry {
    agents: HashMap<GuardianId, GuardianAgent>,
    by_artifact: HashMap<ArtifactId, Vec<GuardianId>>,
}

impl Registry {
    fn for_artifact<'a>(&'a self, artifact_id: &ArtifactId) -> impl Iterator<Item = &'a GuardianAgent> + 'a {
        self.by_artifact
            .get(artifact_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.agents.get(id))
    }

    fn live_primary(&self, artifact_id: &ArtifactId) -> Option<&GuardianAgent> {
        self.for_artifact(artifact_id).find(|g| g.is_primary && !g.is_retired())
    }
}

pub struct GuardianSystem {
    registry: RwLock<Registry>,
    topology: Arc<TopologyRegistry>,
    event_bus: EventBus,
}

impl GuardianSystem {
    pub fn new(topology: Arc<TopologyRegistry>, event_bus: EventBus) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            topology,
            event_bus,
        }
    }

    pub fn create_primary(&self, artifact_id: ArtifactId, node_id: &NodeId, hash: ContentHash) -> MeshResult<GuardianId> {
        if let Some(existing) = self.registry.read().live_primary(&artifact_id) {
            return Err(MeshError::PrimaryGuardianExists {
                artifact_id,
                guardian_id: existing.id,
            });
        }
        self.spawn(artifact_id, node_id, hash, true)
    }

    pub fn add_secondary(&self, artifact_id: ArtifactId, node_id: &NodeId, hash: ContentHash) -> MeshResult<GuardianId> {
        self.spawn(artifact_id, node_id, hash, false)
    }

    fn spawn(&self, artifact_id: ArtifactId, node_id: &NodeId, hash: ContentHash, is_primary: bool) -> MeshResult<GuardianId> {
        let node_reachable = self.topology.get(node_id)?.is_reachable();

        let mut agent = GuardianAgent::spawn(artifact_id, node_id.clone(), is_primary);
        agent.activate(hash)?;
        record_transition(GuardianState::Active);
        if !node_reachable {
            agent.degrade()?;
            record_transition(GuardianState::Degraded);
        }

        let guardian_id = agent.id;
        {
            let mut registry = self.registry.write();
            // Re-check under the write lock so two racing primaries cannot both land.
            if is_primary {
                if let Some(existing) = registry.live_primary(&artifact_id) {
                    return Err(MeshError::PrimaryGuardianExists {
                        artifact_id,
                        guardian_id: existing.id,
                    });
                }
            }
            registry.by_artifact.entry(artifact_id).or_default().push(guardian_id);
            registry.agents.insert(guardian_id, agent);
        }
        self.topology.record_guardian(node_id, guardian_id);

        debug!(%artifact_id, %guardian_id, node = %node_id, is_primary, "Spawned guardian");
        self.event_bus.publish_guardian_event(GuardianEvent::GuardianSpawned {
            guardian_id,
            artifact_id,
            node_id: node_id.clone(),
            is_primary,
        });
        Ok(guardian_id)
    }

    /// Notify every active guardian of the artifact. Returns how many listened.
    pub fn on_change(&self, artifact_id: &ArtifactId, hash: &ContentHash) -> usize {
        let mut registry = self.registry.write();
        let ids = registry.by_artifact.get(artifact_id).cloned().unwrap_or_default();

        let mut notified = 0;
        for id in &ids {
            if let Some(agent) = registry.agents.get_mut(id) {
                if agent.observe_change(hash) {
                    notified += 1;
                }
            }
        }
        notified
    }

    /// Degrade the active guardians hosted on `node_id`.
    pub fn on_node_unavailable(&self, node_id: &NodeId) -> Vec<GuardianId> {
        self.transition_on_node(node_id, GuardianState::Active, |agent| agent.degrade(), GuardianState::Degraded)
    }

    /// Recover the degraded guardians hosted on `node_id`.
    pub fn on_node_available(&self, node_id: &NodeId) -> Vec<GuardianId> {
        self.transition_on_node(node_id, GuardianState::Degraded, |agent| agent.recover(), GuardianState::Active)
    }

    fn transition_on_node(
        &self,
        node_id: &NodeId,
        from: GuardianState,
        apply: impl Fn(&mut GuardianAgent) -> MeshResult<()>,
        to: GuardianState,
    ) -> Vec<GuardianId> {
        let mut changed = Vec::new();
        {
            let mut registry = self.registry.write();
            for agent in registry.agents.values_mut() {
                if &agent.node_id != node_id || agent.state != from {
                    continue;
                }
                match apply(agent) {
                    Ok(()) => changed.push((agent.id, agent.artifact_id)),
                    Err(e) => warn!(guardian_id = %agent.id, error = %e, "Guardian transition rejected"),
                }
            }
        }

        for (guardian_id, artifact_id) in &changed {
            record_transition(to);
            self.event_bus.publish_guardian_event(GuardianEvent::GuardianStateChanged {
                guardian_id: *guardian_id,
                artifact_id: *artifact_id,
                to,
            });
        }
        if !changed.is_empty() {
            info!(node = %node_id, count = changed.len(), state = %to, "Guardians transitioned");
        }
        changed.into_iter().map(|(id, _)| id).collect()
    }

    /// Promote the secondary nearest to `anchor` and retire the current primary.
    pub fn promote(&self, artifact_id: &ArtifactId, anchor: &NodeId) -> MeshResult<GuardianId> {
        let distances = self.topology.distances_from(anchor);

        let (promoted, node_id, retired_primary) = {
            let mut registry = self.registry.write();

            let mut candidates: Vec<&GuardianAgent> = registry
                .for_artifact(artifact_id)
                .filter(|g| !g.is_primary && !g.is_retired() && self.topology.is_reachable(&g.node_id))
                .collect();
            candidates.sort_by(|a, b| {
                compare_latency(distances.get(&a.node_id), distances.get(&b.node_id))
                    .then_with(|| a.node_id.cmp(&b.node_id))
                    .then_with(|| a.id.cmp(&b.id))
            });
            let chosen = candidates
                .first()
                .map(|g| g.id)
                .ok_or(MeshError::NoSecondaryGuardian(*artifact_id))?;

            let previous = registry.live_primary(artifact_id).map(|g| g.id);
            let mut retired_primary = None;
            if let Some(previous) = previous {
                if let Some(agent) = registry.agents.get_mut(&previous) {
                    agent.retire()?;
                    retired_primary = Some((previous, agent.node_id.clone()));
                }
            }

            let agent = registry
                .agents
                .get_mut(&chosen)
                .ok_or(MeshError::GuardianNotFound(chosen))?;
            agent.promote();
            (chosen, agent.node_id.clone(), retired_primary)
        };

        if let Some((previous, previous_node)) = retired_primary {
            self.topology.release_guardian(&previous_node, &previous);
            record_transition(GuardianState::Retired);
            self.event_bus.publish_guardian_event(GuardianEvent::GuardianStateChanged {
                guardian_id: previous,
                artifact_id: *artifact_id,
                to: GuardianState::Retired,
            });
        }

        info!(%artifact_id, guardian_id = %promoted, node = %node_id, anchor = %anchor, "Promoted secondary guardian");
        self.event_bus.publish_guardian_event(GuardianEvent::GuardianPromoted {
            guardian_id: promoted,
            artifact_id: *artifact_id,
            node_id,
            promoted_at: Utc::now(),
        });
        Ok(promoted)
    }

    pub fn retire(&self, guardian_id: &GuardianId) -> MeshResult<Retirement> {
        let retirement = {
            let mut registry = self.registry.write();
            let agent = registry
                .agents
                .get_mut(guardian_id)
                .ok_or(MeshError::GuardianNotFound(*guardian_id))?;
            agent.retire()?;
            Retirement {
                guardian_id: agent.id,
                artifact_id: agent.artifact_id,
                node_id: agent.node_id.clone(),
                was_primary: agent.is_primary,
            }
        };

        self.topology.release_guardian(&retirement.node_id, guardian_id);
        record_transition(GuardianState::Retired);
        self.event_bus.publish_guardian_event(GuardianEvent::GuardianStateChanged {
            guardian_id: *guardian_id,
            artifact_id: retirement.artifact_id,
            to: GuardianState::Retired,
        });
        debug!(%guardian_id, artifact_id = %retirement.artifact_id, was_primary = retirement.was_primary, "Retired guardian");
        Ok(retirement)
    }

    /// Retire every live guardian on a node.
    pub fn retire_on_node(&self, node_id: &NodeId) -> Vec<Retirement> {
        self.retire_where(|g| &g.node_id == node_id)
    }

    /// Retire every live guardian of an artifact.
    pub fn retire_artifact(&self, artifact_id: &ArtifactId) -> Vec<Retirement> {
        self.retire_where(|g| &g.artifact_id == artifact_id)
    }

    fn retire_where(&self, predicate: impl Fn(&GuardianAgent) -> bool) -> Vec<Retirement> {
        let ids: Vec<GuardianId> = self
            .registry
            .read()
            .agents
            .values()
            .filter(|g| !g.is_retired() && predicate(g))
            .map(|g| g.id)
            .collect();

        ids.iter().filter_map(|id| self.retire(id).ok()).collect()
    }

    pub fn report(&self, artifact_id: &ArtifactId) -> GuardianReport {
        let registry = self.registry.read();
        let agents: Vec<&GuardianAgent> = registry.for_artifact(artifact_id).collect();
        let count = |state: GuardianState| agents.iter().filter(|g| g.state == state).count();

        GuardianReport {
            artifact_id: *artifact_id,
            primary: registry.live_primary(artifact_id).cloned(),
            secondaries: agents
                .iter()
                .filter(|g| !g.is_primary && !g.is_retired())
                .map(|g| (*g).clone())
                .collect(),
            active: count(GuardianState::Active),
            degraded: count(GuardianState::Degraded),
            retired: count(GuardianState::Retired),
            changes_detected: agents.iter().map(|g| g.metrics.changes_detected).sum(),
        }
    }

    pub fn get(&self, guardian_id: &GuardianId) -> MeshResult<GuardianAgent> {
        self.registry
            .read()
            .agents
            .get(guardian_id)
            .cloned()
            .ok_or(MeshError::GuardianNotFound(*guardian_id))
    }

    pub fn primary_for(&self, artifact_id: &ArtifactId) -> Option<GuardianAgent> {
        self.registry.read().live_primary(artifact_id).cloned()
    }

    pub fn agents_for(&self, artifact_id: &ArtifactId) -> Vec<GuardianAgent> {
        self.registry.read().for_artifact(artifact_id).cloned().collect()
    }

    pub fn agents_on_node(&self, node_id: &NodeId) -> Vec<GuardianAgent> {
        self.registry
            .read()
            .agents
            .values()
            .filter(|g| &g.node_id == node_id && !g.is_retired())
            .cloned()
            .collect()
    }

    /// Live (non-retired) guardians.
    pub fn count(&self) -> usize {
        self.registry.read().agents.values().filter(|g| !g.is_retired()).count()
    }
}

fn record_transition(to: GuardianState) {
    counter!("codemesh_guardian_transitions_total", "to" => to.as_str()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::{NodeSpec, NodeType};

    fn system() -> GuardianSystem {
        let topology = Arc::new(TopologyRegistry::new(0.9, 0.75));
        for (id, node_type) in [("a", NodeType::Local), ("b", NodeType::Edge), ("c", NodeType::Cloud)] {
            topology.register_node(NodeSpec::new(id, node_type)).unwrap();
        }
        topology.connect(&"a".into(), &"b".into(), 10, 100).unwrap();
        topology.connect(&"a".into(), &"c".into(), 50, 100).unwrap();
        GuardianSystem::new(topology, EventBus::new(16))
    }

    fn artifact() -> ArtifactId {
        ArtifactId::from_path("main.py")
    }

    #[test]
    fn test_single_primary_per_artifact() {
        let system = system();
        let hash = ContentHash::of(b"x");
        let primary = system.create_primary(artifact(), &"a".into(), hash.clone()).unwrap();

        let err = system.create_primary(artifact(), &"b".into(), hash.clone()).unwrap_err();
        assert_eq!(
            err,
            MeshError::PrimaryGuardianExists {
                artifact_id: artifact(),
                guardian_id: primary
            }
        );

        system.add_secondary(artifact(), &"b".into(), hash).unwrap();
        let report = system.report(&artifact());
        assert_eq!(report.primary.map(|g| g.id), Some(primary));
        assert_eq!(report.secondaries.len(), 1);
        assert_eq!(report.active, 2);
    }

    #[test]
    fn test_change_reaches_active_guardians_only() {
        let system = system();
        let hash = ContentHash::of(b"x");
        system.create_primary(artifact(), &"a".into(), hash.clone()).unwrap();
        system.add_secondary(artifact(), &"b".into(), hash.clone()).unwrap();

        assert_eq!(system.on_node_unavailable(&"b".into()).len(), 1);
        assert_eq!(system.on_change(&artifact(), &ContentHash::of(b"y")), 1);

        system.on_node_available(&"b".into());
        assert_eq!(system.on_change(&artifact(), &ContentHash::of(b"z")), 2);
        assert_eq!(system.report(&artifact()).changes_detected, 3);
    }

    #[test]
    fn test_promote_picks_nearest_reachable_secondary() {
        let system = system();
        let hash = ContentHash::of(b"x");
        let primary = system.create_primary(artifact(), &"a".into(), hash.clone()).unwrap();
        let near = system.add_secondary(artifact(), &"b".into(), hash.clone()).unwrap();
        system.add_secondary(artifact(), &"c".into(), hash).unwrap();

        let promoted = system.promote(&artifact(), &"a".into()).unwrap();
        assert_eq!(promoted, near);
        assert!(system.get(&near).unwrap().is_primary);
        assert_eq!(system.get(&primary).unwrap().state, GuardianState::Retired);
        assert_eq!(system.count(), 2);
    }

    #[test]
    fn test_promote_without_candidates() {
        let system = system();
        system.create_primary(artifact(), &"a".into(), ContentHash::of(b"x")).unwrap();
        assert_eq!(
            system.promote(&artifact(), &"a".into()),
            Err(MeshError::NoSecondaryGuardian(artifact()))
        );
    }

    #[test]
    fn test_retire_reports_primary() {
        let system = system();
        let primary = system.create_primary(artifact(), &"a".into(), ContentHash::of(b"x")).unwrap();

        let retirement = system.retire(&primary).unwrap();
        assert!(retirement.was_primary);
        assert!(matches!(system.retire(&primary), Err(MeshError::InvalidGuardianTransition { .. })));
        assert!(system.primary_for(&artifact()).is_none());
    }
}
