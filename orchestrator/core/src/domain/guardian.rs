// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Guardian Agents
//!
//! A guardian watches one artifact replica on one node. Guardians are pure
//! state machines: they learn content hashes and count changes but never touch
//! content.
//!
//! ```text
//! Initializing ──► Active ◄──► Degraded
//!                    │            │
//!                    └──► Retired ◄┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::domain::artifact::{ArtifactId, ContentHash};
use crate::domain::error::{MeshError, MeshResult};
use crate::domain::node::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GuardianId(pub Uuid);

impl GuardianId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GuardianId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GuardianId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    Guardian,
    Monitor,
    Optimizer,
    Security,
    Sync,
    Coordinator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardianState {
    Initializing,
    Active,
    Degraded,
    Retired,
}

impl GuardianState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardianState::Initializing => "initializing",
            GuardianState::Active => "active",
            GuardianState::Degraded => "degraded",
            GuardianState::Retired => "retired",
        }
    }

    pub fn can_transition_to(&self, next: GuardianState) -> bool {
        use GuardianState::*;
        matches!(
            (self, next),
            (Initializing, Active)
                | (Initializing, Retired)
                | (Active, Degraded)
                | (Active, Retired)
                | (Degraded, Active)
                | (Degraded, Retired)
        )
    }
}

impl fmt::Display for GuardianState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardianMetrics {
    pub changes_detected: u64,
    pub last_seen_hash: Option<ContentHash>,
    pub last_action: Option<DateTime<Utc>>,
    pub degraded_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardianAgent {
    pub id: GuardianId,
    pub artifact_id: ArtifactId,
    pub node_id: NodeId,
    pub role: AgentRole,
    pub state: GuardianState,
    pub is_primary: bool,
    pub metrics: GuardianMetrics,
    pub created_at: DateTime<Utc>,
}

impl GuardianAgent {
    pub fn spawn(artifact_id: ArtifactId, node_id: NodeId, is_primary: bool) -> Self {
        Self {
            id: GuardianId::new(),
            artifact_id,
            node_id,
            role: if is_primary { AgentRole::Guardian } else { AgentRole::Monitor },
            state: GuardianState::Initializing,
            is_primary,
            metrics: GuardianMetrics::default(),
            created_at: Utc::now(),
        }
    }

    fn transition(&mut self, next: GuardianState) -> MeshResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(MeshError::InvalidGuardianTransition {
                guardian_id: self.id,
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.metrics.last_action = Some(Utc::now());
        Ok(())
    }

    /// Learn the artifact's current hash and start watching.
    pub fn activate(&mut self, hash: ContentHash) -> MeshResult<()> {
        self.transition(GuardianState::Active)?;
        self.metrics.last_seen_hash = Some(hash);
        Ok(())
    }

    pub fn degrade(&mut self) -> MeshResult<()> {
        self.transition(GuardianState::Degraded)?;
        self.metrics.degraded_count += 1;
        Ok(())
    }

    pub fn recover(&mut self) -> MeshResult<()> {
        self.transition(GuardianState::Active)
    }

    pub fn retire(&mut self) -> MeshResult<()> {
        self.transition(GuardianState::Retired)
    }

    pub fn promote(&mut self) {
        self.is_primary = true;
        self.role = AgentRole::Guardian;
        self.metrics.last_action = Some(Utc::now());
    }

    /// Record a change notification. Only active agents listen.
    pub fn observe_change(&mut self, hash: &ContentHash) -> bool {
        if self.state != GuardianState::Active {
            return false;
        }
        self.metrics.changes_detected += 1;
        self.metrics.last_seen_hash = Some(hash.clone());
        self.metrics.last_action = Some(Utc::now());
        true
    }

    pub fn is_retired(&self) -> bool {
        self.state == GuardianState::Retired
    }
}
