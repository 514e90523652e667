// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain
//!
//! Aggregates, value objects and collaborator contracts of the service bus.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure types and traits; no I/O lives here

pub mod agent;
pub mod app;
pub mod bus_config;
pub mod error;
pub mod events;
pub mod health;
pub mod invocation;
pub mod message;
pub mod session;
pub mod storage;
pub mod task;

pub use error::{BusError, EntityKind, FailureOrigin};
