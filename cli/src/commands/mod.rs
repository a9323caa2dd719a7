// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the CodeMesh CLI

pub mod config;
pub mod mesh;

pub use self::config::ConfigCommand;
pub use self::mesh::MeshCommand;
