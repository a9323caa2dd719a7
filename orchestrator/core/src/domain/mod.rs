// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Mesh nodes, artifacts, guardians and execution plans, plus the
//! collaborator traits implemented by infrastructure adapters.

pub mod artifact;
pub mod error;
pub mod events;
pub mod execution;
pub mod guardian;
pub mod mesh_config;
pub mod node;
pub mod runtime;
pub mod topology;
