// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod backend;
pub mod event_bus;
pub mod transport;

pub use backend::DigestBackend;
pub use transport::InMemoryNetwork;
