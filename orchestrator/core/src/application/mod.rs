// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod coordinator;
pub mod guardians;
pub mod replication;
pub mod router;

pub use coordinator::{FileMonitor, MeshCoordinator, MeshStatus, NodeSummary};
pub use guardians::{GuardianReport, GuardianSystem};
pub use replication::{ReplicationManager, ReplicationStatus, ReplicaView, SyncEvent, SyncOutcome, SyncStats};
pub use router::ExecutionRouter;
