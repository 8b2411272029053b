// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! VRAM-budgeted model residency.
//!
//! The manager owns all VRAM accounting: which models are resident, how much
//! of the budget they occupy, and which may be evicted to make room.  One
//! manager-level mutex protects the accounting; each model additionally has
//! its own load lock so two tasks requesting the same model coalesce into a
//! single backend load (double-check pattern).  Keep-warm models and models
//! whose load lock is currently held are never eviction candidates.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{BackendError, LlmBackend};

struct LoadedModel {
    vram_gb: f64,
    use_count: u64,
    load_time: Duration,
    /// Monotonic manager tick of the last touch; smallest tick = LRU victim.
    loaded_at: u64,
}

#[derive(Debug, Default)]
struct Metrics {
    hits: u64,
    misses: u64,
    evictions: u64,
    prewarm_count: u64,
    total_load_time: Duration,
}

#[derive(Default)]
struct ManagerState {
    loaded: HashMap<String, LoadedModel>,
    /// VRAM reserved for loads currently in flight; counted against the
    /// budget but not yet eviction candidates.
    pending: HashMap<String, f64>,
    keep_warm: HashSet<String>,
    locks: HashMap<String, Arc<Mutex<()>>>,
    prewarms: HashMap<String, JoinHandle<Result<(), BackendError>>>,
    metrics: Metrics,
}

impl ManagerState {
    fn used_gb(&self) -> f64 {
        self.loaded.values().map(|m| m.vram_gb).sum::<f64>()
            + self.pending.values().sum::<f64>()
    }
}

/// Snapshot of manager counters and residency.
#[derive(Debug, Clone)]
pub struct ManagerStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub prewarm_count: u64,
    pub total_load_time: Duration,
    pub used_gb: f64,
    pub usable_gb: f64,
    pub loaded: Vec<String>,
}

pub struct ModelManager {
    backend: Arc<dyn LlmBackend>,
    total_vram_gb: f64,
    reserve_vram_gb: f64,
    state: Mutex<ManagerState>,
    clock: AtomicU64,
}

impl ModelManager {
    pub fn new(backend: Arc<dyn LlmBackend>, total_vram_gb: f64, reserve_vram_gb: f64) -> Self {
        Self {
            backend,
            total_vram_gb,
            reserve_vram_gb,
            state: Mutex::new(ManagerState::default()),
            clock: AtomicU64::new(0),
        }
    }

    /// VRAM available to models after the reserve is taken off the top.
    pub fn usable_gb(&self) -> f64 {
        (self.total_vram_gb - self.reserve_vram_gb).max(0.0)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// True when `vram_gb` more could be admitted right now without any
    /// eviction.  Models already resident cost zero marginal VRAM; callers
    /// check residency via [`Self::loaded_models`] first.
    pub async fn can_load(&self, vram_gb: f64) -> bool {
        let state = self.state.lock().await;
        state.used_gb() + vram_gb <= self.usable_gb() + f64::EPSILON
    }

    pub async fn is_loaded(&self, model: &str) -> bool {
        self.state.lock().await.loaded.contains_key(model)
    }

    pub async fn loaded_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().await.loaded.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn add_keep_warm(&self, model: impl Into<String>) {
        self.state.lock().await.keep_warm.insert(model.into());
    }

    pub async fn remove_keep_warm(&self, model: &str) {
        self.state.lock().await.keep_warm.remove(model);
    }

    /// Make `model` resident, evicting least-recently-used models if needed.
    ///
    /// Hit: the model is already resident — touch it and return.  Miss:
    /// acquire the per-model lock, re-check, free enough VRAM (skipping
    /// keep-warm and lock-held entries, LRU first), then load through the
    /// backend.  Fails with a RESOURCE error when eviction cannot free
    /// enough VRAM or the backend load fails.
    pub async fn load(&self, model: &str, vram_gb: f64) -> Result<(), BackendError> {
        // Fast path + per-model lock acquisition under the manager mutex.
        let model_lock = {
            let mut state = self.state.lock().await;
            if self.touch(&mut state, model) {
                return Ok(());
            }
            state.metrics.misses += 1;
            state
                .locks
                .entry(model.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let _guard = model_lock.lock().await;

        // Double-check: another waiter may have completed the load while we
        // were queued on the model lock.
        let victims = {
            let mut state = self.state.lock().await;
            if self.touch(&mut state, model) {
                // The miss above was counted before coalescing; correct it.
                state.metrics.misses -= 1;
                return Ok(());
            }
            if vram_gb > self.usable_gb() {
                return Err(BackendError::resource(format!(
                    "{model} needs {vram_gb} GB but only {} GB are usable",
                    self.usable_gb()
                )));
            }
            let victims = self.select_victims(&mut state, model, vram_gb)?;
            // Reserve the footprint so concurrent admission decisions see it.
            state.pending.insert(model.to_string(), vram_gb);
            state.metrics.evictions += victims.len() as u64;
            victims
        };

        for victim in &victims {
            debug!(model = %victim, "evicting for {model}");
            if let Err(e) = self.backend.unload(victim).await {
                warn!(model = %victim, error = %e, "backend unload failed during eviction");
            }
        }

        let started = Instant::now();
        let load_result = self.backend.load(model).await;
        let load_time = started.elapsed();

        let mut state = self.state.lock().await;
        state.pending.remove(model);
        match load_result {
            Ok(()) => {
                let tick = self.tick();
                state.loaded.insert(
                    model.to_string(),
                    LoadedModel {
                        vram_gb,
                        use_count: 1,
                        load_time,
                        loaded_at: tick,
                    },
                );
                state.metrics.total_load_time += load_time;
                Ok(())
            }
            Err(e) => Err(BackendError {
                category: crate::ErrorCategory::Resource,
                message: format!("loading {model} failed: {}", e.message),
            }),
        }
    }

    /// Alias for [`Self::load`]; reads as intent at call sites that only
    /// need residency, not a fresh load.
    pub async fn ensure_loaded(&self, model: &str, vram_gb: f64) -> Result<(), BackendError> {
        self.load(model, vram_gb).await
    }

    /// Touch a resident model: refresh its LRU position and hit counters.
    /// Returns false when the model is not resident.
    fn touch(&self, state: &mut ManagerState, model: &str) -> bool {
        let tick = self.tick();
        match state.loaded.get_mut(model) {
            Some(entry) => {
                entry.loaded_at = tick;
                entry.use_count += 1;
                state.metrics.hits += 1;
                true
            }
            None => false,
        }
    }

    /// Pick LRU victims until `vram_gb` fits, removing them from the
    /// accounting.  Keep-warm models and models whose load lock is held are
    /// never selected.  Errors with RESOURCE when the remaining evictable
    /// set cannot free enough.
    fn select_victims(
        &self,
        state: &mut ManagerState,
        model: &str,
        vram_gb: f64,
    ) -> Result<Vec<String>, BackendError> {
        let mut victims: Vec<(String, LoadedModel)> = Vec::new();
        while state.used_gb() + vram_gb > self.usable_gb() + f64::EPSILON {
            let candidate = state
                .loaded
                .iter()
                .filter(|(name, _)| {
                    name.as_str() != model
                        && !state.keep_warm.contains(name.as_str())
                        && state
                            .locks
                            .get(name.as_str())
                            .map(|l| l.try_lock().is_ok())
                            .unwrap_or(true)
                })
                .min_by_key(|(_, m)| m.loaded_at)
                .map(|(name, _)| name.clone());
            match candidate {
                Some(name) => {
                    let entry = state.loaded.remove(&name);
                    if let Some(entry) = entry {
                        victims.push((name, entry));
                    }
                }
                None => {
                    // Roll back: the load is not happening, so the victims
                    // stay resident with their original accounting.
                    warn!(model, "eviction aborted; keeping current residents");
                    for (name, entry) in victims {
                        state.loaded.insert(name, entry);
                    }
                    return Err(BackendError::resource(format!(
                        "cannot free {vram_gb} GB for {model}: only keep-warm or in-use models remain"
                    )));
                }
            }
        }
        Ok(victims.into_iter().map(|(name, _)| name).collect())
    }

    /// Drop a model from the accounting and release its VRAM.
    pub async fn unload(&self, model: &str) -> Result<(), BackendError> {
        let was_loaded = {
            let mut state = self.state.lock().await;
            state.loaded.remove(model).is_some()
        };
        if was_loaded {
            self.backend.unload(model).await?;
        }
        Ok(())
    }

    /// Schedule a background load and return immediately; the load itself
    /// runs on its own task.  Duplicate pre-warms for the same model
    /// coalesce: a second request while one is in flight is a no-op.
    pub async fn prewarm(self: &Arc<Self>, model: impl Into<String>, vram_gb: f64) {
        let model = model.into();
        let mut state = self.state.lock().await;
        if state.loaded.contains_key(&model) {
            return;
        }
        if let Some(handle) = state.prewarms.get(&model) {
            if !handle.is_finished() {
                return;
            }
        }
        state.metrics.prewarm_count += 1;
        let mgr = Arc::clone(self);
        let load_model = model.clone();
        let handle = tokio::spawn(async move { mgr.load(&load_model, vram_gb).await });
        state.prewarms.insert(model, handle);
    }

    /// Block until an outstanding pre-warm for `model` finishes.  Returns
    /// Ok(()) when no pre-warm was pending (including already-resident
    /// models).
    pub async fn wait_for_prewarm(&self, model: &str) -> Result<(), BackendError> {
        let handle = {
            let mut state = self.state.lock().await;
            state.prewarms.remove(model)
        };
        match handle {
            Some(h) => match h.await {
                Ok(result) => result,
                Err(e) => Err(BackendError::fatal(format!("prewarm task panicked: {e}"))),
            },
            None => Ok(()),
        }
    }

    pub async fn stats(&self) -> ManagerStats {
        let state = self.state.lock().await;
        let mut loaded: Vec<String> = state.loaded.keys().cloned().collect();
        loaded.sort();
        ManagerStats {
            hits: state.metrics.hits,
            misses: state.metrics.misses,
            evictions: state.metrics.evictions,
            prewarm_count: state.metrics.prewarm_count,
            total_load_time: state.metrics.total_load_time,
            used_gb: state.used_gb(),
            usable_gb: self.usable_gb(),
            loaded,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorCategory, ScriptedBackend};

    fn manager(total: f64, reserve: f64) -> (Arc<ModelManager>, Arc<ScriptedBackend>) {
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let mgr = Arc::new(ModelManager::new(backend.clone(), total, reserve));
        (mgr, backend)
    }

    #[tokio::test]
    async fn second_load_is_a_hit() {
        let (mgr, backend) = manager(16.0, 0.0);
        mgr.load("a", 5.0).await.unwrap();
        mgr.load("a", 5.0).await.unwrap();
        assert_eq!(backend.loads.lock().unwrap().len(), 1);
        let stats = mgr.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn used_gb_tracks_loaded_models() {
        let (mgr, _) = manager(16.0, 2.0);
        mgr.load("a", 5.0).await.unwrap();
        mgr.load("b", 5.0).await.unwrap();
        let stats = mgr.stats().await;
        assert_eq!(stats.used_gb, 10.0);
        assert_eq!(stats.usable_gb, 14.0);
        assert!(!mgr.can_load(5.0).await);
        assert!(mgr.can_load(4.0).await);
    }

    #[tokio::test]
    async fn eviction_follows_lru_order() {
        let (mgr, backend) = manager(16.0, 2.0);
        mgr.load("a", 5.0).await.unwrap();
        mgr.load("b", 5.0).await.unwrap();
        // Touch "a" so "b" becomes the LRU entry.
        mgr.load("a", 5.0).await.unwrap();
        mgr.load("c", 10.0).await.unwrap();
        // 10 GB needed, 4 free → both a and b must go, b (LRU) first.
        assert_eq!(*backend.unloads.lock().unwrap(), vec!["b", "a"]);
        assert_eq!(mgr.loaded_models().await, vec!["c"]);
        assert_eq!(mgr.stats().await.evictions, 2);
    }

    #[tokio::test]
    async fn keep_warm_is_never_evicted() {
        let (mgr, _) = manager(16.0, 2.0);
        mgr.load("warm", 8.0).await.unwrap();
        mgr.add_keep_warm("warm").await;
        mgr.load("other", 2.0).await.unwrap();
        // 10 used, 4 free; 8 GB would require evicting "warm" as well.
        let err = mgr.load("big", 8.0).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Resource);
        // Both residents survived the failed admission, footprint intact.
        assert_eq!(mgr.loaded_models().await, vec!["other", "warm"]);
        assert_eq!(mgr.stats().await.used_gb, 10.0);
    }

    #[tokio::test]
    async fn oversized_model_fails_resource() {
        let (mgr, _) = manager(8.0, 0.0);
        let err = mgr.load("huge", 12.0).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Resource);
        assert!(mgr.loaded_models().await.is_empty());
    }

    #[tokio::test]
    async fn backend_load_failure_is_resource_and_not_accounted() {
        let backend = Arc::new(ScriptedBackend::new(vec![]).fail_load("broken"));
        let mgr = ModelManager::new(backend, 16.0, 0.0);
        let err = mgr.load("broken", 4.0).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::Resource);
        assert_eq!(mgr.stats().await.used_gb, 0.0);
    }

    #[tokio::test]
    async fn unload_releases_vram() {
        let (mgr, backend) = manager(16.0, 0.0);
        mgr.load("a", 5.0).await.unwrap();
        mgr.unload("a").await.unwrap();
        assert!(mgr.loaded_models().await.is_empty());
        assert_eq!(*backend.unloads.lock().unwrap(), vec!["a"]);
        // Unloading a non-resident model is a no-op.
        mgr.unload("a").await.unwrap();
        assert_eq!(backend.unloads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prewarm_loads_in_background() {
        let (mgr, backend) = manager(16.0, 0.0);
        mgr.prewarm("a", 5.0).await;
        mgr.wait_for_prewarm("a").await.unwrap();
        assert!(mgr.is_loaded("a").await);
        // The later explicit load is a hit, not a second backend load.
        mgr.load("a", 5.0).await.unwrap();
        assert_eq!(backend.loads.lock().unwrap().len(), 1);
        assert_eq!(mgr.stats().await.prewarm_count, 1);
    }

    #[tokio::test]
    async fn wait_for_prewarm_without_request_is_ok() {
        let (mgr, _) = manager(16.0, 0.0);
        mgr.wait_for_prewarm("never-requested").await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_loads_of_same_model_coalesce() {
        let (mgr, backend) = manager(16.0, 0.0);
        let (m1, m2) = (Arc::clone(&mgr), Arc::clone(&mgr));
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { m1.load("a", 5.0).await }),
            tokio::spawn(async move { m2.load("a", 5.0).await }),
        );
        r1.unwrap().unwrap();
        r2.unwrap().unwrap();
        assert_eq!(backend.loads.lock().unwrap().len(), 1);
        assert_eq!(mgr.stats().await.used_gb, 5.0);
    }
}
