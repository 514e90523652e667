// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the agentbus CLI

pub mod config;
pub mod probe;
pub mod serve;
pub mod tools;

pub use self::config::ConfigCommand;
pub use self::probe::ProbeArgs;
pub use self::serve::ServeArgs;
pub use self::tools::ToolsArgs;
