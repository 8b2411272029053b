// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The single façade over the kernel.
//!
//! A root task goes in, the scheduler is pumped batch by batch until the
//! root reaches a terminal state, and the root's result comes back out.
//! Each batch runs its agent loops as independent tokio tasks; loop results
//! are applied to the task graph here, child terminations are routed to the
//! delegation manager, and successful sessions feed the pattern store and
//! episodic memory.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use tracing::{info, warn};

use sindri_config::{AgentRegistry, Config};
use sindri_memory::ContextBuilder;
use sindri_model::{LlmBackend, ModelManager};
use sindri_store::SessionStore;
use sindri_tools::ToolRegistry;

use crate::agent::{AgentLoop, LoopDeps};
use crate::bus::{EventBus, EventKind};
use crate::delegation::DelegationManager;
use crate::scheduler::Scheduler;
use crate::task::{LoopOutcome, LoopResult, Task, TaskId, TaskResult, TaskStatus};

/// The injected service set; a small startup routine composes these and
/// hands them over — no process-wide singletons.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<Config>,
    pub agents: Arc<AgentRegistry>,
    pub backend: Arc<dyn LlmBackend>,
    pub models: Arc<ModelManager>,
    pub tools: Arc<ToolRegistry>,
    pub store: Arc<SessionStore>,
    pub memory: Arc<ContextBuilder>,
    pub bus: Arc<EventBus>,
}

pub struct Orchestrator {
    services: Services,
    scheduler: Arc<Scheduler>,
    delegation: Arc<DelegationManager>,
    project_id: String,
    work_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(services: Services, project_id: impl Into<String>, work_dir: PathBuf) -> Self {
        let scheduler = Arc::new(Scheduler::new(services.bus.clone()));
        let delegation = Arc::new(DelegationManager::new(
            scheduler.clone(),
            services.agents.clone(),
            services.models.clone(),
            services.store.clone(),
            services.bus.clone(),
            services.config.max_delegation_depth,
            services.config.default_max_iterations,
        ));
        Self {
            services,
            scheduler,
            delegation,
            project_id: project_id.into(),
            work_dir,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Create the root task, pump the scheduler until it terminates, and
    /// return its result.
    pub async fn run_root_task(
        &self,
        description: &str,
        agent_name: &str,
    ) -> anyhow::Result<TaskResult> {
        let def = self
            .services
            .agents
            .get(agent_name)
            .with_context(|| format!("unknown agent: {agent_name}"))?;
        let root = Task::for_agent(
            description,
            def,
            self.services.config.default_max_iterations,
        );
        let root_id = self.scheduler.add(root);
        info!(task = %root_id, agent = agent_name, "root task created");

        self.pump(&root_id).await?;

        let root = self
            .scheduler
            .get(&root_id)
            .context("root task vanished from the scheduler")?;
        Ok(root.result.unwrap_or(TaskResult {
            success: false,
            output: String::new(),
            error: Some(format!("task ended in state {:?} with no result", root.status)),
        }))
    }

    /// Drive batches until the root task is terminal.
    async fn pump(&self, root_id: &str) -> anyhow::Result<()> {
        loop {
            let root_done = self
                .scheduler
                .get(root_id)
                .map(|t| t.status.is_terminal())
                .unwrap_or(true);
            if root_done {
                return Ok(());
            }

            self.services
                .bus
                .publish(EventKind::Heartbeat, None, json!({}));

            // Between batches nothing is running, so every resident model is
            // evictable and the full usable budget is on the table; resident
            // models still admit their tasks at zero marginal cost.
            let stats = self.services.models.stats().await;
            let loaded = self.services.models.loaded_models().await;
            let batch = self.scheduler.ready_batch(stats.usable_gb, &loaded);
            if batch.is_empty() {
                anyhow::bail!(
                    "scheduler wedged: no runnable tasks while the root task is not terminal"
                );
            }

            let batch_ids: Vec<TaskId> = batch.iter().map(|t| t.id.clone()).collect();
            self.services.bus.publish(
                EventKind::ParallelBatchStart,
                None,
                json!({ "task_ids": batch_ids }),
            );
            let resident_before = loaded;

            let mut handles: Vec<(TaskId, tokio::task::JoinHandle<LoopResult>)> = Vec::new();
            for task in &batch {
                self.scheduler.mark_running(&task.id);
                let Some(agent) = self.services.agents.get(&task.assigned_agent).cloned() else {
                    self.scheduler
                        .mark_failed(&task.id, format!("unknown agent: {}", task.assigned_agent));
                    continue;
                };
                let deps = LoopDeps {
                    config: self.services.config.clone(),
                    backend: self.services.backend.clone(),
                    models: self.services.models.clone(),
                    tools: self.services.tools.clone(),
                    store: self.services.store.clone(),
                    memory: self.services.memory.clone(),
                    bus: self.services.bus.clone(),
                    scheduler: self.scheduler.clone(),
                    delegation: Some(self.delegation.clone()),
                    project_id: self.project_id.clone(),
                    work_dir: self.work_dir.clone(),
                };
                let agent_loop = AgentLoop::new(agent, deps);
                let task_id = task.id.clone();
                let handle =
                    tokio::spawn(async move { agent_loop.run(&task_id).await });
                handles.push((task.id.clone(), handle));
            }

            for (task_id, handle) in handles {
                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(task = %task_id, error = %e, "agent loop panicked");
                        LoopResult::failed(0, "agent_loop_panicked")
                    }
                };
                self.apply(&task_id, result).await;
            }

            self.services
                .bus
                .publish(EventKind::ParallelBatchEnd, None, json!({}));
            // Models that fell out of residency during the batch were
            // evicted by the manager; surface that to subscribers.
            let resident_after = self.services.models.loaded_models().await;
            for model in resident_before
                .iter()
                .filter(|m| !resident_after.contains(m))
            {
                self.services
                    .bus
                    .publish(EventKind::ModelUnloaded, None, json!({ "model": model }));
            }
            let stats = self.services.models.stats().await;
            self.services.bus.publish(
                EventKind::MetricsUpdated,
                None,
                json!({
                    "model_hits": stats.hits,
                    "model_misses": stats.misses,
                    "evictions": stats.evictions,
                    "vram_used_gb": stats.used_gb,
                    "pending_tasks": self.scheduler.pending_count(),
                }),
            );
        }
    }

    /// Fold one loop result into the task graph.
    async fn apply(&self, task_id: &str, result: LoopResult) {
        let Some(task) = self.scheduler.get(task_id) else {
            return;
        };
        match result.outcome {
            LoopOutcome::Completed => {
                self.scheduler.mark_completed(
                    task_id,
                    TaskResult {
                        success: true,
                        output: result.final_output.clone(),
                        error: None,
                    },
                );
                // Re-read: a cancellation racing the completion wins.
                let Some(task) = self.scheduler.get(task_id) else {
                    return;
                };
                if task.status != TaskStatus::Complete {
                    return;
                }
                if task.parent_id.is_some() {
                    self.delegation.on_child_completed(&task);
                }
                self.learn_from(&task).await;
                self.record_episode(&task, "task_completed", &result.final_output)
                    .await;
            }
            LoopOutcome::Failed => {
                if task.cancel_requested || task.status == TaskStatus::Cancelled {
                    // Cancellation wins; never downgrade to FAILED.
                    self.scheduler.mark_cancelled(task_id);
                } else {
                    self.scheduler.mark_failed(task_id, result.reason.clone());
                    self.services.bus.publish(
                        EventKind::Error,
                        Some(task_id.to_string()),
                        json!({ "reason": result.reason }),
                    );
                }
                let Some(task) = self.scheduler.get(task_id) else {
                    return;
                };
                if task.parent_id.is_some() && task.status == TaskStatus::Failed {
                    self.delegation.on_child_failed(&task, &result.reason);
                }
                if task.status == TaskStatus::Failed {
                    self.record_episode(&task, "task_failed", &result.reason).await;
                }
            }
            LoopOutcome::DelegationWaiting => {
                // The delegate call already parked the task; make sure the
                // state sticks even if the tool result raced a transition.
                if self
                    .scheduler
                    .get(task_id)
                    .map(|t| !t.status.is_terminal())
                    .unwrap_or(false)
                {
                    self.scheduler.mark_waiting(task_id);
                }
            }
        }
    }

    /// Extract the tool sequence from a completed session and reinforce the
    /// pattern store.
    async fn learn_from(&self, task: &Task) {
        let Some(session_id) = &task.session_id else {
            return;
        };
        let Ok(session) = self.services.store.load_session(session_id) else {
            return;
        };
        let mut sequence: Vec<String> = Vec::new();
        for turn in &session.turns {
            for call in turn.tool_calls.iter().flatten() {
                if sequence.last().map(|l| l != &call.name).unwrap_or(true) {
                    sequence.push(call.name.clone());
                }
            }
        }
        let keywords: Vec<String> = task
            .description
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| w.len() > 3)
            .take(8)
            .map(|w| w.to_lowercase())
            .collect();
        match self.services.memory.pattern_store().learn(
            &task.assigned_agent,
            &keywords,
            &sequence,
            true,
        ) {
            Ok(Some(pattern)) => {
                self.services.bus.publish(
                    EventKind::PatternLearned,
                    Some(task.id.clone()),
                    json!({ "pattern": pattern.id, "success_rate": pattern.success_rate }),
                );
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "pattern learning failed"),
        }
    }

    async fn record_episode(&self, task: &Task, event_type: &str, detail: &str) {
        let content = format!("Task '{}': {detail}", task.description);
        if let Err(e) = self
            .services
            .memory
            .record_episode(
                &self.project_id,
                event_type,
                &content,
                json!({ "task_id": task.id, "agent": task.assigned_agent }),
            )
            .await
        {
            warn!(error = %e, "episode recording failed");
        }
    }
}
