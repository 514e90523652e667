// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Storage backends
//!
//! Concrete implementations of [`crate::domain::storage::Storage`], selected
//! at startup from `spec.storage.backend`.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure Layer
//! - **Purpose:** Volatile in-process store for development and tests;
//!   PostgreSQL store for shared, durable deployments

pub mod memory;
pub mod postgres;

pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;
