// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! agentbus core
//!
//! Lifecycle-and-proxy layer of the agent service bus: agent and app
//! registries, the per-(agent, app) session pool, the proxy executor and the
//! task store, all sharing one pluggable [`domain::storage::Storage`].
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Wires domain, application and infrastructure layers; see
//!   [`bus::ServiceBus`] for the composition root.

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod bus;

pub use domain::*;
pub use bus::{ServiceBus, ServiceBusBuilder};
