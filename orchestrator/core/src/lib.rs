// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! CodeMesh Core
//!
//! Coordinator for a distributed code mesh: node topology, artifact
//! replication, guardian watchers and execution routing.
//!
//! # Architecture
//!
//! - **domain:** value types, aggregates and the topology registry
//! - **application:** replication, guardian, routing services and the
//!   [`MeshCoordinator`](application::coordinator::MeshCoordinator) facade
//! - **infrastructure:** event bus and in-process adapters

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
pub use application::coordinator::MeshCoordinator;
