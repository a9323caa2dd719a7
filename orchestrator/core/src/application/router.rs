// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Execution Router
//!
//! Chooses where an artifact runs and runs it through the
//! [`ExecutionBackend`].
//!
//! Candidates are ranked by:
//! 1. holding a consistent replica of the current version
//! 2. lower load
//! 3. lower path latency to the requesting node (unreachable last)
//! 4. node id
//!
//! A hybrid run executes on the best node and on the best node of a
//! different type, then compares the outputs. Disagreement opens an
//! execution-mismatch conflict on the artifact.

use bytes::Bytes;
use chrono::Utc;
use metrics::{counter, histogram};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::application::replication::ReplicationManager;
use crate::domain::artifact::{ArtifactId, ConflictReason};
use crate::domain::error::{MeshError, MeshResult};
use crate::domain::events::ExecutionEvent;
use crate::domain::execution::{
    ExecutionContext, ExecutionPlan, ExecutionRecord, ExecutionResult, ExecutionStats, ExecutionStatus,
    NodeOutcome, PlanId, ReplicaPull,
};
use crate::domain::mesh_config::MeshSettings;
use crate::domain::node::{MeshNode, NodeId};
use crate::domain::runtime::ExecutionBackend;
use crate::domain::topology::{compare_latency, TopologyRegistry};
use crate::infrastructure::event_bus::EventBus;

/// Failover candidates kept on a typed plan.
const MAX_BACKUPS: usize = 2;

#[derive(Default)]
struct Tally {
    total: u64,
    completed: u64,
    failed: u64,
    mismatched: u64,
    timed_out: u64,
    served: u64,
    duration_sum_ms: u64,
}

pub struct ExecutionRouter {
    topology: Arc<TopologyRegistry>,
    replication: Arc<ReplicationManager>,
    backend: Arc<dyn ExecutionBackend>,
    event_bus: EventBus,
    timeout_ms: u64,
    hybrid_deadline_ms: u64,
    history: RwLock<HashMap<ArtifactId, Vec<ExecutionRecord>>>,
    tally: Mutex<Tally>,
}

impl ExecutionRouter {
    pub fn new(
        topology: Arc<TopologyRegistry>,
        replication: Arc<ReplicationManager>,
        backend: Arc<dyn ExecutionBackend>,
        event_bus: EventBus,
        settings: &MeshSettings,
    ) -> Self {
        Self {
            topology,
            replication,
            backend,
            event_bus,
            timeout_ms: settings.execution_timeout_ms,
            hybrid_deadline_ms: settings.hybrid_deadline_ms.max(settings.execution_timeout_ms),
            history: RwLock::new(HashMap::new()),
            tally: Mutex::new(Tally::default()),
        }
    }

    pub async fn plan(
        &self,
        artifact_id: &ArtifactId,
        context: ExecutionContext,
        origin: &NodeId,
    ) -> MeshResult<ExecutionPlan> {
        self.topology.ensure_exists(origin)?;
        let placement = self.replication.placement(artifact_id).await?;
        if let Some(conflict) = placement.conflict {
            return Err(MeshError::ConflictUnresolved {
                artifact_id: *artifact_id,
                divergent_nodes: conflict.divergent_nodes,
            });
        }

        let no_eligible = |reason: String| MeshError::NoEligibleNode {
            artifact_id: *artifact_id,
            context,
            reason,
        };

        let max_load = self.topology.max_load();
        let mut candidates: Vec<MeshNode> = self
            .topology
            .list()
            .into_iter()
            .filter(|n| !n.decommissioned && n.is_available(max_load))
            .filter(|n| context.node_type().is_none_or(|t| n.node_type == t))
            .collect();

        let distances = self.topology.distances_from(origin);
        candidates.sort_by(|a, b| {
            let a_holds = placement.holders.contains(&a.id);
            let b_holds = placement.holders.contains(&b.id);
            b_holds
                .cmp(&a_holds)
                .then_with(|| a.load.total_cmp(&b.load))
                .then_with(|| compare_latency(distances.get(&a.id), distances.get(&b.id)))
                .then_with(|| a.id.cmp(&b.id))
        });

        let Some(primary) = candidates.first().map(|n| n.id.clone()) else {
            let reason = match context.node_type() {
                Some(t) => format!("no available {t} node"),
                None => "no available node".to_string(),
            };
            return Err(no_eligible(reason));
        };

        let (backup_nodes, hybrid_backup) = if context == ExecutionContext::Hybrid {
            let primary_type = candidates[0].node_type;
            let backup = candidates
                .iter()
                .find(|n| n.node_type != primary_type)
                .map(|n| n.id.clone())
                .ok_or_else(|| no_eligible(format!("hybrid run needs an available node that is not {primary_type}")))?;
            (vec![backup.clone()], Some(backup))
        } else {
            let backups = candidates.iter().skip(1).take(MAX_BACKUPS).map(|n| n.id.clone()).collect();
            (backups, None)
        };

        let mut pulls = Vec::new();
        for node in std::iter::once(&primary).chain(hybrid_backup.iter()) {
            if placement.holders.contains(node) {
                continue;
            }
            let from = self
                .nearest_holder(node, &placement.holders)
                .ok_or_else(|| no_eligible("no consistent replica to pull from".to_string()))?;
            pulls.push(ReplicaPull {
                from,
                to: node.clone(),
            });
        }

        let plan = ExecutionPlan {
            id: PlanId::new(),
            artifact_id: *artifact_id,
            context,
            origin: origin.clone(),
            steps: ExecutionPlan::build_steps(&primary, hybrid_backup.as_ref(), &pulls),
            primary_node: primary,
            backup_nodes,
            pulls,
            timeout_ms: self.timeout_ms,
            created_at: Utc::now(),
            result: None,
        };

        debug!(
            plan_id = %plan.id,
            %artifact_id,
            %context,
            primary = %plan.primary_node,
            pulls = plan.pulls.len(),
            "Planned execution"
        );
        self.event_bus.publish_execution_event(ExecutionEvent::ExecutionPlanned {
            plan_id: plan.id,
            artifact_id: *artifact_id,
            context,
            primary_node: plan.primary_node.clone(),
        });
        Ok(plan)
    }

    fn nearest_holder(&self, node: &NodeId, holders: &BTreeSet<NodeId>) -> Option<NodeId> {
        let distances = self.topology.distances_from(node);
        holders
            .iter()
            .min_by(|a, b| compare_latency(distances.get(*a), distances.get(*b)).then_with(|| a.cmp(b)))
            .cloned()
    }

    /// Plan and run in one call.
    pub async fn route(
        &self,
        artifact_id: &ArtifactId,
        context: ExecutionContext,
        origin: &NodeId,
    ) -> MeshResult<ExecutionResult> {
        let plan = self.plan(artifact_id, context, origin).await?;
        self.execute(plan).await
    }

    pub async fn execute(&self, plan: ExecutionPlan) -> MeshResult<ExecutionResult> {
        let (plan, failover) = match self.revalidate(plan).await {
            Ok(revalidated) => revalidated,
            Err((plan, err)) => {
                self.record(plan, Err(&err));
                return Err(err);
            }
        };

        let outcome = self.run_plan(&plan, failover).await;
        self.record(plan, outcome.as_ref());
        outcome
    }

    /// Swap out executing nodes that went away since planning.
    async fn revalidate(&self, plan: ExecutionPlan) -> Result<(ExecutionPlan, bool), (ExecutionPlan, MeshError)> {
        let runners: Vec<&NodeId> = if plan.is_hybrid() {
            std::iter::once(&plan.primary_node).chain(plan.backup_nodes.iter()).collect()
        } else {
            vec![&plan.primary_node]
        };
        if runners.iter().all(|n| self.topology.is_available(n)) {
            return Ok((plan, false));
        }

        if !plan.is_hybrid() {
            let backup = plan.backup_nodes.iter().find(|n| self.topology.is_available(n)).cloned();
            if let Some(backup) = backup {
                warn!(plan_id = %plan.id, from = %plan.primary_node, to = %backup, "Primary unavailable; failing over to backup");
                let mut plan = plan;
                plan.backup_nodes.retain(|n| n != &backup);
                plan.primary_node = backup;
                plan.pulls.clear();
                plan.steps = ExecutionPlan::build_steps(&plan.primary_node, None, &plan.pulls);
                return Ok((plan, true));
            }
        }

        warn!(plan_id = %plan.id, "Planned nodes unavailable; rebuilding plan");
        match self.plan(&plan.artifact_id, plan.context, &plan.origin).await {
            Ok(rebuilt) => Ok((rebuilt, true)),
            Err(e) => Err((plan, e)),
        }
    }

    async fn run_plan(&self, plan: &ExecutionPlan, failover: bool) -> MeshResult<ExecutionResult> {
        let runners: Vec<NodeId> = if plan.is_hybrid() {
            std::iter::once(plan.primary_node.clone())
                .chain(plan.backup_nodes.first().cloned())
                .collect()
        } else {
            vec![plan.primary_node.clone()]
        };

        // Make sure every runner holds the current version.
        let placement = self.replication.placement(&plan.artifact_id).await?;
        for node in &runners {
            if !placement.holders.contains(node) {
                self.replication.add_replica(&plan.artifact_id, node).await?;
            }
        }
        let content = self.replication.read_content(&plan.artifact_id, &plan.primary_node).await?;

        let mut outcomes = BTreeMap::new();
        let (status, served_by, failover) = if let [primary, backup] = runners.as_slice() {
            let primary_node = self.topology.get(primary)?;
            let backup_node = self.topology.get(backup)?;
            let (primary_outcome, backup_outcome) = tokio::join!(
                self.run_on(&content, &primary_node, plan.timeout_ms),
                self.run_on(&content, &backup_node, self.hybrid_deadline_ms),
            );
            outcomes.insert(primary.clone(), primary_outcome.clone());
            outcomes.insert(backup.clone(), backup_outcome.clone());

            match (primary_outcome.output(), backup_outcome.output()) {
                (Some(a), Some(b)) if a != b => {
                    warn!(artifact_id = %plan.artifact_id, %primary, %backup, "Hybrid outputs disagree");
                    self.replication
                        .flag_conflict(&plan.artifact_id, ConflictReason::ExecutionMismatch, vec![primary.clone(), backup.clone()])
                        .await?;
                    (ExecutionStatus::Mismatch, Some(primary.clone()), failover)
                }
                (Some(_), _) => (ExecutionStatus::Completed, Some(primary.clone()), failover),
                (None, Some(_)) => {
                    info!(artifact_id = %plan.artifact_id, %backup, "Primary did not complete; backup serves");
                    (ExecutionStatus::Completed, Some(backup.clone()), true)
                }
                (None, None) => {
                    if primary_outcome.is_timeout() || backup_outcome.is_timeout() {
                        return Err(MeshError::Timeout {
                            artifact_id: plan.artifact_id,
                            node_id: primary.clone(),
                            timeout_ms: plan.timeout_ms,
                        });
                    }
                    (ExecutionStatus::Failed, None, failover)
                }
            }
        } else {
            let node = self.topology.get(&plan.primary_node)?;
            let outcome = self.run_on(&content, &node, plan.timeout_ms).await;
            outcomes.insert(node.id.clone(), outcome.clone());
            match outcome {
                NodeOutcome::Completed { .. } => (ExecutionStatus::Completed, Some(node.id.clone()), failover),
                NodeOutcome::Failed { .. } => (ExecutionStatus::Failed, None, failover),
                NodeOutcome::TimedOut { .. } => {
                    return Err(MeshError::Timeout {
                        artifact_id: plan.artifact_id,
                        node_id: node.id.clone(),
                        timeout_ms: plan.timeout_ms,
                    });
                }
            }
        };

        let output = served_by
            .as_ref()
            .and_then(|n| outcomes.get(n))
            .and_then(|o| o.output())
            .map(str::to_string);

        Ok(ExecutionResult {
            plan_id: plan.id,
            artifact_id: plan.artifact_id,
            context: plan.context,
            outcomes,
            served_by,
            status,
            output,
            failover,
            completed_at: Utc::now(),
        })
    }

    async fn run_on(&self, content: &Bytes, node: &MeshNode, timeout_ms: u64) -> NodeOutcome {
        let started = Instant::now();
        match tokio::time::timeout(Duration::from_millis(timeout_ms), self.backend.run(content, node)).await {
            Ok(Ok(output)) => NodeOutcome::Completed {
                output,
                duration_ms: started.elapsed().as_millis() as u64,
            },
            Ok(Err(e)) => {
                warn!(node = %node.id, error = %e, "Execution failed");
                NodeOutcome::Failed { error: e.to_string() }
            }
            Err(_) => {
                warn!(node = %node.id, timeout_ms, "Execution timed out");
                NodeOutcome::TimedOut { after_ms: timeout_ms }
            }
        }
    }

    fn record(&self, mut plan: ExecutionPlan, outcome: Result<&ExecutionResult, &MeshError>) {
        let artifact_id = plan.artifact_id;
        let context = plan.context;
        let plan_id = plan.id;

        let status_label = {
            let mut tally = self.tally.lock();
            tally.total += 1;
            match outcome {
                Ok(result) => {
                    match result.status {
                        ExecutionStatus::Completed => tally.completed += 1,
                        ExecutionStatus::Failed => tally.failed += 1,
                        ExecutionStatus::Mismatch => tally.mismatched += 1,
                    }
                    if let Some(duration_ms) = result.duration_ms() {
                        tally.served += 1;
                        tally.duration_sum_ms += duration_ms;
                        histogram!("codemesh_execution_duration_ms").record(duration_ms as f64);
                    }
                    result.status.as_str()
                }
                Err(MeshError::Timeout { .. }) => {
                    tally.timed_out += 1;
                    "timeout"
                }
                Err(_) => {
                    tally.failed += 1;
                    "error"
                }
            }
        };
        counter!("codemesh_executions_total", "context" => context.as_str(), "status" => status_label).increment(1);

        let (result, error) = match outcome {
            Ok(result) => {
                info!(%plan_id, %artifact_id, status = status_label, served_by = ?result.served_by, "Execution finished");
                self.event_bus.publish_execution_event(ExecutionEvent::ExecutionFinished {
                    plan_id,
                    artifact_id,
                    status: result.status,
                    served_by: result.served_by.clone(),
                    finished_at: result.completed_at,
                });
                (Some(result.clone()), None)
            }
            Err(e) => {
                warn!(%plan_id, %artifact_id, error = %e, "Execution failed");
                self.event_bus.publish_execution_event(ExecutionEvent::ExecutionFailed {
                    plan_id,
                    artifact_id,
                    reason: e.to_string(),
                    failed_at: Utc::now(),
                });
                (None, Some(e.to_string()))
            }
        };

        plan.result = result.clone();
        self.history.write().entry(artifact_id).or_default().push(ExecutionRecord {
            plan,
            result,
            error,
            recorded_at: Utc::now(),
        });
    }

    pub fn history(&self, artifact_id: &ArtifactId) -> Vec<ExecutionRecord> {
        self.history.read().get(artifact_id).cloned().unwrap_or_default()
    }

    pub fn total_executions(&self) -> u64 {
        self.tally.lock().total
    }

    pub fn stats(&self) -> ExecutionStats {
        let tally = self.tally.lock();
        ExecutionStats {
            total: tally.total,
            completed: tally.completed,
            failed: tally.failed,
            mismatched: tally.mismatched,
            timed_out: tally.timed_out,
            avg_duration_ms: if tally.served == 0 {
                0.0
            } else {
                tally.duration_sum_ms as f64 / tally.served as f64
            },
        }
    }
}
