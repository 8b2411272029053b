// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/sindri/config.yaml"));
    paths.push(PathBuf::from("/etc/sindri/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/sindri/config.yaml"));
        paths.push(home.join(".config/sindri/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("sindri/config.yaml"));
        paths.push(cfg.join("sindri/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".sindri/config.yaml"));
    paths.push(PathBuf::from(".sindri/config.yml"));
    paths.push(PathBuf::from("sindri.yaml"));
    paths.push(PathBuf::from("sindri.yml"));

    paths
}

/// Every key the kernel recognizes at the top level of a config file.
const KNOWN_KEYS: &[&str] = &[
    "total_vram_gb",
    "reserve_vram_gb",
    "max_context_tokens",
    "memory_tier_shares",
    "max_delegation_depth",
    "default_max_iterations",
    "streaming",
    "stuck",
    "retry",
    "checkpoint",
];

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (e.g. `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let layer = read_layer(&path)?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let layer = read_layer(p)?;
        merge_yaml(&mut merged, layer);
    }

    warn_unknown_keys(&merged);

    // Deserialize the merged YAML value into Config, falling back to defaults
    // when the merged value is empty (no config files found).
    let config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        Config::default()
    } else {
        let pruned = prune_unknown_keys(merged);
        serde_yaml::from_value(pruned).unwrap_or_default()
    };
    Ok(config)
}

fn read_layer(path: &Path) -> anyhow::Result<serde_yaml::Value> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

/// Warn once per unrecognized top-level option.  Unknown options never fail
/// a load; they are ignored so older configs keep working.
fn warn_unknown_keys(merged: &serde_yaml::Value) {
    let serde_yaml::Value::Mapping(map) = merged else {
        return;
    };
    let known: BTreeSet<&str> = KNOWN_KEYS.iter().copied().collect();
    for key in map.keys() {
        if let Some(name) = key.as_str() {
            if !known.contains(name) {
                warn!(option = name, "unrecognized config option; ignoring");
            }
        }
    }
}

/// Remove unknown top-level keys before deserializing so a stray option
/// cannot make `serde_yaml::from_value` bail out to all-defaults.
fn prune_unknown_keys(merged: serde_yaml::Value) -> serde_yaml::Value {
    let serde_yaml::Value::Mapping(map) = merged else {
        return merged;
    };
    let known: BTreeSet<&str> = KNOWN_KEYS.iter().copied().collect();
    let kept: serde_yaml::Mapping = map
        .into_iter()
        .filter(|(k, _)| k.as_str().map(|n| known.contains(n)).unwrap_or(false))
        .collect();
    serde_yaml::Value::Mapping(kept)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
