// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Execution plans and results produced by the
//! [`ExecutionRouter`](crate::application::router::ExecutionRouter).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::artifact::ArtifactId;
use crate::domain::node::{NodeId, NodeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanId(pub Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionContext {
    Local,
    Edge,
    Cloud,
    Quantum,
    /// Run on two nodes of different types and compare
    Hybrid,
}

impl ExecutionContext {
    /// Node type a typed context runs on. `None` for hybrid.
    pub fn node_type(&self) -> Option<NodeType> {
        match self {
            ExecutionContext::Local => Some(NodeType::Local),
            ExecutionContext::Edge => Some(NodeType::Edge),
            ExecutionContext::Cloud => Some(NodeType::Cloud),
            ExecutionContext::Quantum => Some(NodeType::QuantumBackend),
            ExecutionContext::Hybrid => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionContext::Local => "local",
            ExecutionContext::Edge => "edge",
            ExecutionContext::Cloud => "cloud",
            ExecutionContext::Quantum => "quantum",
            ExecutionContext::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionContext {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(ExecutionContext::Local),
            "edge" => Ok(ExecutionContext::Edge),
            "cloud" => Ok(ExecutionContext::Cloud),
            "quantum" => Ok(ExecutionContext::Quantum),
            "hybrid" => Ok(ExecutionContext::Hybrid),
            other => Err(format!("unknown execution context: {other}")),
        }
    }
}

/// Replica copy the plan needs before executing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaPull {
    pub from: NodeId,
    pub to: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanStep {
    FetchReplica { from: NodeId, to: NodeId },
    Execute { node_id: NodeId },
    CompareResults { primary: NodeId, backup: NodeId },
    RecordResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: PlanId,
    pub artifact_id: ArtifactId,
    pub context: ExecutionContext,
    pub origin: NodeId,
    pub primary_node: NodeId,
    pub backup_nodes: Vec<NodeId>,
    pub pulls: Vec<ReplicaPull>,
    pub steps: Vec<PlanStep>,
    pub timeout_ms: u64,
    pub created_at: DateTime<Utc>,
    pub result: Option<ExecutionResult>,
}

impl ExecutionPlan {
    /// Lay out the ordered steps for the chosen nodes.
    pub fn build_steps(primary: &NodeId, hybrid_backup: Option<&NodeId>, pulls: &[ReplicaPull]) -> Vec<PlanStep> {
        let mut steps: Vec<PlanStep> = pulls
            .iter()
            .map(|p| PlanStep::FetchReplica {
                from: p.from.clone(),
                to: p.to.clone(),
            })
            .collect();

        steps.push(PlanStep::Execute {
            node_id: primary.clone(),
        });
        if let Some(backup) = hybrid_backup {
            steps.push(PlanStep::Execute {
                node_id: backup.clone(),
            });
            steps.push(PlanStep::CompareResults {
                primary: primary.clone(),
                backup: backup.clone(),
            });
        }
        steps.push(PlanStep::RecordResult);
        steps
    }

    pub fn is_hybrid(&self) -> bool {
        self.context == ExecutionContext::Hybrid
    }

    pub fn pull_for(&self, node_id: &NodeId) -> Option<&ReplicaPull> {
        self.pulls.iter().find(|p| &p.to == node_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NodeOutcome {
    Completed { output: String, duration_ms: u64 },
    Failed { error: String },
    TimedOut { after_ms: u64 },
}

impl NodeOutcome {
    pub fn output(&self) -> Option<&str> {
        match self {
            NodeOutcome::Completed { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, NodeOutcome::TimedOut { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    /// Hybrid run where the two nodes disagreed
    Mismatch,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Mismatch => "mismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub plan_id: PlanId,
    pub artifact_id: ArtifactId,
    pub context: ExecutionContext,
    pub outcomes: BTreeMap<NodeId, NodeOutcome>,
    pub served_by: Option<NodeId>,
    pub status: ExecutionStatus,
    pub output: Option<String>,
    /// Set when the plan's primary was replaced before or during the run
    pub failover: bool,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn duration_ms(&self) -> Option<u64> {
        let served_by = self.served_by.as_ref()?;
        match self.outcomes.get(served_by)? {
            NodeOutcome::Completed { duration_ms, .. } => Some(*duration_ms),
            _ => None,
        }
    }
}

/// One attempt kept in the router history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub plan: ExecutionPlan,
    pub result: Option<ExecutionResult>,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub mismatched: u64,
    pub timed_out: u64,
    pub avg_duration_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_maps_to_node_type() {
        assert_eq!(ExecutionContext::Quantum.node_type(), Some(NodeType::QuantumBackend));
        assert_eq!(ExecutionContext::Hybrid.node_type(), None);
        assert_eq!("Edge".parse::<ExecutionContext>(), Ok(ExecutionContext::Edge));
        assert!("gpu".parse::<ExecutionContext>().is_err());
    }

    #[test]
    fn test_hybrid_steps_order() {
        let pulls = vec![ReplicaPull {
            from: NodeId::from("a"),
            to: NodeId::from("b"),
        }];
        let steps = ExecutionPlan::build_steps(&NodeId::from("b"), Some(&NodeId::from("c")), &pulls);

        assert_eq!(steps.len(), 5);
        assert!(matches!(steps[0], PlanStep::FetchReplica { .. }));
        assert!(matches!(steps[3], PlanStep::CompareResults { .. }));
        assert_eq!(steps[4], PlanStep::RecordResult);
    }

    #[test]
    fn test_wire_tags() {
        let step = serde_json::to_value(PlanStep::Execute { node_id: "vm".into() }).unwrap();
        assert_eq!(step["action"], "execute");
        assert_eq!(step["node_id"], "vm");

        let outcome = serde_json::to_value(NodeOutcome::TimedOut { after_ms: 50 }).unwrap();
        assert_eq!(outcome["outcome"], "timed_out");
    }
}
