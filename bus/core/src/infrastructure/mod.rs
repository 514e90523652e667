// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod db;
pub mod event_bus;
pub mod health_probe;
pub mod keyed_lock;
pub mod mcp_client;
pub mod storage;

pub use event_bus::{EventBus, EventReceiver};
pub use health_probe::HttpHealthProbe;
pub use keyed_lock::KeyedLocks;
pub use mcp_client::McpHttpConnector;
pub use storage::{MemoryStorage, PostgresStorage};
