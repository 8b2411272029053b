// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be on unless explicitly disabled
/// need a named function.
fn default_true() -> bool {
    true
}

fn default_total_vram() -> f64 {
    16.0
}

fn default_max_context_tokens() -> usize {
    32_768
}

fn default_max_delegation_depth() -> usize {
    5
}

fn default_max_iterations() -> u32 {
    25
}

/// Kernel configuration.
///
/// Every recognized option is an explicit field here; there is no
/// reflection-driven option discovery.  Unknown keys in a config file are
/// reported with a warning by the loader and otherwise ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Hard ceiling on the concurrent loaded-model footprint, in GB.
    #[serde(default = "default_total_vram")]
    pub total_vram_gb: f64,
    /// Subtracted from the total before any admission decision.
    #[serde(default)]
    pub reserve_vram_gb: f64,
    /// Upper bound handed to the context builder.
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    /// Overrides for the default memory tier split.
    #[serde(default)]
    pub memory_tier_shares: MemoryTierShares,
    /// Delegation cycle/limit guard.
    #[serde(default = "default_max_delegation_depth")]
    pub max_delegation_depth: usize,
    /// Fallback when an agent definition omits `max_iterations`.
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,
    /// Stream tokens from the backend instead of waiting for full responses.
    #[serde(default = "default_true")]
    pub streaming: bool,
    #[serde(default)]
    pub stuck: StuckConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            total_vram_gb: default_total_vram(),
            reserve_vram_gb: 0.0,
            max_context_tokens: default_max_context_tokens(),
            memory_tier_shares: MemoryTierShares::default(),
            max_delegation_depth: default_max_delegation_depth(),
            default_max_iterations: default_max_iterations(),
            streaming: true,
            stuck: StuckConfig::default(),
            retry: RetryConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl Config {
    /// Usable VRAM after the reserve is taken off the top.
    pub fn usable_vram_gb(&self) -> f64 {
        (self.total_vram_gb - self.reserve_vram_gb).max(0.0)
    }
}

/// Percentage split of the context token budget across memory tiers.
///
/// Values are percentages and should sum to ≤ 100; unused share is left
/// empty rather than spilled into other tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryTierShares {
    pub working: u8,
    pub episodic: u8,
    pub semantic: u8,
    pub pattern: u8,
    pub analysis: u8,
}

impl Default for MemoryTierShares {
    fn default() -> Self {
        Self {
            working: 50,
            episodic: 18,
            semantic: 18,
            pattern: 5,
            analysis: 9,
        }
    }
}

/// Stuck-detection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckConfig {
    /// Word-overlap fraction (0..1) above which two consecutive responses
    /// count as repetition.
    pub similarity_threshold: f64,
    /// Consecutive nudges without progress before the loop gives up.
    pub max_nudges: u32,
}

impl Default for StuckConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.8,
            max_nudges: 3,
        }
    }
}

/// Tool-retry tuning for TRANSIENT failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            max_ms: 5_000,
            multiplier: 2.0,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Disable for ephemeral runs; no checkpoints are written or cleared.
    pub enabled: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
