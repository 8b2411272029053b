// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent definition registry.
//!
//! An agent is a named policy: a model, a prompt, a tool whitelist, iteration
//! limits, and a delegation whitelist.  Definitions are static data loaded
//! from YAML — either one document with a top-level `agents:` map, or a
//! directory of `<name>.yaml` files, one agent per file.
//!
//! ```yaml
//! agents:
//!   coder:
//!     role: "writes and edits code"
//!     model: qwen2.5-coder:14b
//!     fallback_model: qwen2.5-coder:7b
//!     vram_gb: 10.0
//!     fallback_vram_gb: 6.0
//!     tools: [write_file, read_file, shell]
//!     max_iterations: 20
//!     delegate_to: [reviewer]
//!     prompt: |
//!       You are a focused coding agent...
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Static definition of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    /// Unique name used for assignment and delegation targeting.
    #[serde(default)]
    pub name: String,
    /// Human-readable role description, injected into delegation prompts.
    #[serde(default)]
    pub role: String,
    /// Primary model identifier.
    pub model: String,
    /// Smaller model to fall back to when the primary cannot be loaded.
    #[serde(default)]
    pub fallback_model: Option<String>,
    /// VRAM footprint of the primary model, in GB.
    pub vram_gb: f64,
    /// VRAM footprint of the fallback model, in GB.
    #[serde(default)]
    pub fallback_vram_gb: Option<f64>,
    /// Names of tools this agent may call.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Per-agent iteration cap; falls back to `default_max_iterations`.
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// Agents this one is allowed to delegate to.
    #[serde(default)]
    pub delegate_to: Vec<String>,
    /// System prompt.
    pub prompt: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Per-agent override of the repetition-overlap threshold.
    #[serde(default)]
    pub similarity_threshold: Option<f64>,
    /// Per-agent override of the nudge escalation cap.
    #[serde(default)]
    pub max_nudges: Option<u32>,
    /// Pure-analysis agents complete without any tool executions; the
    /// completion validator skips the tool-run requirement for them.
    #[serde(default)]
    pub analysis_only: bool,
}

/// Lookup table of agent definitions by name.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentDefinition>,
}

#[derive(Debug, Deserialize)]
struct AgentsFile {
    agents: HashMap<String, AgentDefinition>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a single YAML document with a top-level `agents:` map.
    /// Map keys win over any `name:` field inside a definition.
    pub fn load_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let file: AgentsFile = serde_yaml::from_str(&text)?;
        let mut reg = Self::new();
        for (name, mut def) in file.agents {
            def.name = name;
            reg.insert(def);
        }
        Ok(reg)
    }

    /// Load every `*.yaml` / `*.yml` in a directory; one agent per file,
    /// named after the file stem unless the definition carries a `name:`.
    /// Unparseable files are skipped with a warning rather than failing the
    /// whole registry.
    pub fn load_dir(dir: &Path) -> anyhow::Result<Self> {
        let mut reg = Self::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }
            let text = std::fs::read_to_string(&path)?;
            match serde_yaml::from_str::<AgentDefinition>(&text) {
                Ok(mut def) => {
                    if def.name.is_empty() {
                        def.name = path
                            .file_stem()
                            .and_then(|s| s.to_str())
                            .unwrap_or_default()
                            .to_string();
                    }
                    reg.insert(def);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed agent definition");
                }
            }
        }
        Ok(reg)
    }

    pub fn insert(&mut self, def: AgentDefinition) {
        self.agents.insert(def.name.clone(), def);
    }

    pub fn get(&self, name: &str) -> Option<&AgentDefinition> {
        self.agents.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// True when `from` is allowed to delegate to `to`.
    pub fn may_delegate(&self, from: &str, to: &str) -> bool {
        self.get(from)
            .map(|d| d.delegate_to.iter().any(|t| t == to))
            .unwrap_or(false)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
