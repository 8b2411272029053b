// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agents;
mod loader;
mod schema;

pub use agents::{AgentDefinition, AgentRegistry};
pub use loader::load;
pub use schema::{
    CheckpointConfig, Config, MemoryTierShares, RetryConfig, StuckConfig,
};
