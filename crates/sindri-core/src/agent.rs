// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use sindri_config::{AgentDefinition, Config};
use sindri_memory::ContextBuilder;
use sindri_model::{
    BackendError, ChatResponse, ErrorCategory, LlmBackend, ModelManager, ToolSchema, Turn,
};
use sindri_store::{CheckpointRecord, SessionRecord, SessionStatus, SessionStore, StoreError};
use sindri_tools::{contains_json_like, parse_tool_calls, RetryPolicy, ToolRegistry};

use crate::bus::{EventBus, EventKind};
use crate::delegation::{DelegateTool, DelegationManager, DELEGATE_TOOL_NAME};
use crate::scheduler::Scheduler;
use crate::stuck::StuckDetector;
use crate::task::{LoopResult, Task, TaskStatus};

/// Literal completion marker an agent embeds in its final response.
pub const COMPLETION_MARKER: &str = "<sindri:complete/>";

/// Everything one loop run needs, injected; no process-wide state.
#[derive(Clone)]
pub struct LoopDeps {
    pub config: Arc<Config>,
    pub backend: Arc<dyn LlmBackend>,
    pub models: Arc<ModelManager>,
    pub tools: Arc<ToolRegistry>,
    pub store: Arc<SessionStore>,
    pub memory: Arc<ContextBuilder>,
    pub bus: Arc<EventBus>,
    pub scheduler: Arc<Scheduler>,
    pub delegation: Option<Arc<DelegationManager>>,
    pub project_id: String,
    pub work_dir: PathBuf,
}

/// One per executing task: drives the model ↔ tool loop until the task
/// completes, fails, or pauses on a delegation.
pub struct AgentLoop {
    agent: AgentDefinition,
    deps: LoopDeps,
}

impl AgentLoop {
    pub fn new(agent: AgentDefinition, deps: LoopDeps) -> Self {
        Self { agent, deps }
    }

    /// Run the loop for `task_id` to a [`LoopResult`].  State transitions
    /// are requested only through the returned result; the one exception is
    /// cancellation, which is finalized in place so it can never be
    /// overwritten by a later failure.
    pub async fn run(&self, task_id: &str) -> LoopResult {
        let Some(task) = self.deps.scheduler.get(task_id) else {
            return LoopResult::failed(0, "unknown_task");
        };

        let mut session = match self.load_or_create_session(&task).await {
            Ok(s) => s,
            Err(e) => {
                self.emit_error(task_id, &format!("session store failure: {e}"));
                return LoopResult::failed(0, "store_error");
            }
        };

        let registry = self.build_registry(task_id);
        let schemas = registry.schemas();

        let mut active_model = match self.acquire_model(task_id).await {
            Ok(model) => model,
            Err(reason) => return LoopResult::failed(0, reason),
        };

        let (mut any_tool_executed, mut any_write_succeeded) =
            seed_progress_flags(&session, &registry);
        let retry_policy = RetryPolicy::from(&self.deps.config.retry);
        let mut stuck = StuckDetector::new(
            self.agent
                .similarity_threshold
                .unwrap_or(self.deps.config.stuck.similarity_threshold),
            self.agent
                .max_nudges
                .unwrap_or(self.deps.config.stuck.max_nudges),
        );

        let max_iterations = task.max_iterations.max(1);
        for iteration in 1..=max_iterations {
            // Cancellation check at the loop head.
            if self.cancel_requested(task_id) {
                self.deps.scheduler.mark_cancelled(task_id);
                return LoopResult::failed(iteration - 1, "cancelled");
            }

            let left = max_iterations - iteration + 1;
            if matches!(left, 5 | 3 | 1) {
                let hint = format!(
                    "Heads-up: {left} iteration(s) remain for this task. \
                     Wrap up and emit {COMPLETION_MARKER} when done."
                );
                if let Err(e) = self.append(&mut session, Turn::user(&hint)) {
                    return self.store_failure(task_id, iteration, e);
                }
                self.deps.bus.publish(
                    EventKind::IterationWarning,
                    Some(task_id.to_string()),
                    json!({ "iterations_left": left }),
                );
            }

            self.deps.bus.publish(
                EventKind::IterationStart,
                Some(task_id.to_string()),
                json!({ "iteration": iteration, "max_iterations": max_iterations }),
            );

            // Token-budgeted context assembly; on memory failure, fall back
            // to the raw session log rather than losing the iteration.
            let messages = match self
                .deps
                .memory
                .build(
                    &self.deps.project_id,
                    &task.description,
                    &session.turns,
                    self.deps.config.max_context_tokens,
                )
                .await
            {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "context assembly failed; using raw session turns");
                    session.turns.clone()
                }
            };

            let response = match self.chat(task_id, &active_model, &messages, &schemas).await {
                Ok(r) => r,
                Err(e) if e.category == ErrorCategory::Resource => {
                    // Mid-run resource exhaustion: degrade to the fallback
                    // model once, otherwise the task fails as RESOURCE.
                    match self.degrade_model(task_id, &active_model).await {
                        Some(fallback) => {
                            active_model = fallback;
                            continue;
                        }
                        None => {
                            self.emit_error(task_id, &e.to_string());
                            self.checkpoint(task_id, &session.id, iteration, "failed", Some(e.to_string()));
                            return LoopResult::failed(iteration, "model_unavailable");
                        }
                    }
                }
                Err(e) => {
                    self.emit_error(task_id, &e.to_string());
                    self.checkpoint(task_id, &session.id, iteration, "failed", Some(e.to_string()));
                    return LoopResult::failed(iteration, "backend_error");
                }
            };

            // Cancellation check once more after the call returns; an
            // in-flight stream is allowed to finish first.
            if self.cancel_requested(task_id) {
                self.deps.scheduler.mark_cancelled(task_id);
                return LoopResult::failed(iteration, "cancelled");
            }

            self.deps.bus.publish(
                EventKind::AgentOutput,
                Some(task_id.to_string()),
                json!({ "text": response.text }),
            );

            // Native tool calls are trusted; the text parser is the
            // fallback for backends without a tool-call protocol.
            let mut calls = response.native_tool_calls.clone();
            if calls.is_empty() {
                calls = parse_tool_calls(&response.text);
                if calls.is_empty() && contains_json_like(&response.text) {
                    warn!(task = task_id, "response looked like a tool call but none parsed");
                    self.deps.bus.publish(
                        EventKind::ToolParseFailed,
                        Some(task_id.to_string()),
                        json!({ "text_len": response.text.len() }),
                    );
                }
            }

            let assistant_turn = if calls.is_empty() {
                Turn::assistant(&response.text)
            } else {
                Turn::assistant_with_calls(&response.text, calls.clone())
            };
            if let Err(e) = self.append(&mut session, assistant_turn) {
                return self.store_failure(task_id, iteration, e);
            }

            // Tool execution comes before any completion-marker handling.
            let mut executed_any = false;
            let mut delegated = false;
            for call in &calls {
                stuck.observe_tool_call(&call.name, &call.arguments);
                self.deps.bus.publish(
                    EventKind::ToolCalled,
                    Some(task_id.to_string()),
                    json!({ "tool": call.name, "call_id": call.id }),
                );
                let result = registry
                    .execute_with_retry(call, &self.deps.work_dir, &retry_policy)
                    .await;
                executed_any = true;
                if result.success {
                    any_tool_executed = true;
                    stuck.note_progress();
                    if registry.is_write_class(&call.name) {
                        any_write_succeeded = true;
                    }
                    if call.name == DELEGATE_TOOL_NAME {
                        delegated = true;
                    }
                }
                if let Err(e) = self.append(&mut session, Turn::tool(result.feedback())) {
                    return self.store_failure(task_id, iteration, e);
                }
            }

            // A successful delegation pauses this loop; the scheduler will
            // re-admit the task once the child terminates.
            if delegated {
                self.checkpoint(task_id, &session.id, iteration, "waiting", None);
                let _ = self.deps.store.set_iteration_count(&session.id, iteration);
                return LoopResult::delegation_waiting(iteration);
            }

            let trigger = stuck.observe_response(&response.text, executed_any);
            let has_marker = response.text.contains(COMPLETION_MARKER);

            // The marker is honored only in an iteration that executed no
            // tools; a tool-bearing response always earns one more round.
            if !executed_any && has_marker {
                if self.completion_valid(any_tool_executed, any_write_succeeded, &registry) {
                    let final_output = response
                        .text
                        .replace(COMPLETION_MARKER, "")
                        .trim()
                        .to_string();
                    let _ = self.deps.store.set_iteration_count(&session.id, iteration);
                    let _ = self
                        .deps
                        .store
                        .set_session_status(&session.id, SessionStatus::Complete);
                    if self.deps.config.checkpoint.enabled {
                        let _ = self.deps.store.clear_checkpoint(task_id);
                    }
                    return LoopResult::completed(iteration, final_output);
                }
                debug!(task = task_id, "completion marker rejected by validation");
                let correction = Turn::user(
                    "You indicated completion but haven't performed the required work; continue.",
                );
                if let Err(e) = self.append(&mut session, correction) {
                    return self.store_failure(task_id, iteration, e);
                }
            } else if let Some(trigger) = trigger {
                if stuck.nudges_exhausted() {
                    self.checkpoint(
                        task_id,
                        &session.id,
                        iteration,
                        "failed",
                        Some(format!("stuck: {trigger}")),
                    );
                    let _ = self
                        .deps
                        .store
                        .set_session_status(&session.id, SessionStatus::Failed);
                    return LoopResult::failed(iteration, "stuck");
                }
                stuck.note_nudge();
                debug!(task = task_id, trigger, nudges = stuck.nudge_count(), "injecting nudge");
                if let Err(e) = self.append(&mut session, Turn::user(nudge_text(trigger))) {
                    return self.store_failure(task_id, iteration, e);
                }
            }

            self.checkpoint(task_id, &session.id, iteration, "running", None);
            let _ = self.deps.store.set_iteration_count(&session.id, iteration);
        }

        self.checkpoint(
            task_id,
            &session.id,
            max_iterations,
            "failed",
            Some("max_iterations_reached".into()),
        );
        let _ = self
            .deps
            .store
            .set_session_status(&session.id, SessionStatus::Failed);
        LoopResult::failed(max_iterations, "max_iterations_reached")
    }

    // ── Session handling ─────────────────────────────────────────────────────

    async fn load_or_create_session(&self, task: &Task) -> Result<SessionRecord, StoreError> {
        if let Some(sid) = &task.session_id {
            match self.deps.store.load_session(sid) {
                Ok(s) => return Ok(s),
                Err(e) => {
                    warn!(session = %sid, error = %e, "session load failed; creating a replacement");
                    let mut session = self.seed_session(task)?;
                    self.deps.scheduler.replace_session_id(&task.id, &session.id);
                    session.task_description = task.description.clone();
                    return Ok(session);
                }
            }
        }
        let session = self.seed_session(task)?;
        self.deps.scheduler.set_session_id(&task.id, &session.id);
        Ok(session)
    }

    fn seed_session(&self, task: &Task) -> Result<SessionRecord, StoreError> {
        let mut session = self
            .deps
            .store
            .create_session(&task.description, &task.model_name)?;
        let system = Turn::system(&self.agent.prompt);
        let user = Turn::user(&task.description);
        self.deps.store.append_turn(&session.id, &system)?;
        self.deps.store.append_turn(&session.id, &user)?;
        session.turns.push(system);
        session.turns.push(user);
        Ok(session)
    }

    fn append(&self, session: &mut SessionRecord, turn: Turn) -> Result<(), StoreError> {
        self.deps.store.append_turn(&session.id, &turn)?;
        session.turns.push(turn);
        Ok(())
    }

    // ── Model acquisition ────────────────────────────────────────────────────

    async fn acquire_model(&self, task_id: &str) -> Result<String, String> {
        match self
            .deps
            .models
            .ensure_loaded(&self.agent.model, self.agent.vram_gb)
            .await
        {
            Ok(()) => {
                self.deps.bus.publish(
                    EventKind::ModelLoaded,
                    Some(task_id.to_string()),
                    json!({ "model": self.agent.model }),
                );
                Ok(self.agent.model.clone())
            }
            Err(e) if e.category == ErrorCategory::Resource => {
                match self.degrade_model(task_id, &self.agent.model).await {
                    Some(fallback) => Ok(fallback),
                    None => {
                        self.emit_error(task_id, &e.to_string());
                        Err("model_unavailable".into())
                    }
                }
            }
            Err(e) => {
                self.emit_error(task_id, &e.to_string());
                Err("model_unavailable".into())
            }
        }
    }

    /// Try to switch to the fallback model.  Returns its name when loaded.
    async fn degrade_model(&self, task_id: &str, current: &str) -> Option<String> {
        let fallback = self.agent.fallback_model.as_ref()?;
        if fallback == current {
            return None; // already degraded once
        }
        let vram = self.agent.fallback_vram_gb.unwrap_or(self.agent.vram_gb);
        match self.deps.models.ensure_loaded(fallback, vram).await {
            Ok(()) => {
                warn!(from = current, to = %fallback, "degrading to fallback model");
                self.deps.bus.publish(
                    EventKind::ModelDegraded,
                    Some(task_id.to_string()),
                    json!({ "from": current, "to": fallback }),
                );
                Some(fallback.clone())
            }
            Err(e) => {
                warn!(error = %e, "fallback model load failed");
                None
            }
        }
    }

    // ── LLM call ─────────────────────────────────────────────────────────────

    /// One completion with streaming fan-out and TRANSIENT retry.
    async fn chat(
        &self,
        task_id: &str,
        model: &str,
        messages: &[Turn],
        schemas: &[ToolSchema],
    ) -> Result<ChatResponse, BackendError> {
        let policy = RetryPolicy::from(&self.deps.config.retry);
        let mut attempt = 1u32;
        loop {
            let result = if self.deps.config.streaming {
                self.deps.bus.publish(
                    EventKind::StreamingStart,
                    Some(task_id.to_string()),
                    json!({ "model": model }),
                );
                let (tx, mut rx) = mpsc::channel::<String>(64);
                let bus = self.deps.bus.clone();
                let tid = task_id.to_string();
                let forward = tokio::spawn(async move {
                    while let Some(token) = rx.recv().await {
                        bus.publish(
                            EventKind::StreamingToken,
                            Some(tid.clone()),
                            json!({ "token": token }),
                        );
                    }
                });
                let result = self.deps.backend.chat_stream(model, messages, schemas, tx).await;
                let _ = forward.await;
                self.deps.bus.publish(
                    EventKind::StreamingEnd,
                    Some(task_id.to_string()),
                    json!({}),
                );
                result
            } else {
                self.deps.backend.chat(model, messages, schemas).await
            };

            match result {
                Ok(r) => return Ok(r),
                Err(e)
                    if e.category == ErrorCategory::Transient && attempt < policy.max_attempts =>
                {
                    warn!(attempt, error = %e, "transient backend error; retrying");
                    tokio::time::sleep(policy.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ── Completion validation ────────────────────────────────────────────────

    /// The marker alone never finishes a task: the session must show real
    /// work.  Analysis-only agents are exempt; agents carrying write-class
    /// tools must additionally have landed at least one successful write.
    fn completion_valid(
        &self,
        any_tool_executed: bool,
        any_write_succeeded: bool,
        registry: &ToolRegistry,
    ) -> bool {
        if self.agent.analysis_only {
            return true;
        }
        if !any_tool_executed {
            return false;
        }
        let has_write_tools = registry
            .names()
            .iter()
            .any(|n| registry.is_write_class(n));
        !(has_write_tools && !any_write_succeeded)
    }

    // ── Plumbing ─────────────────────────────────────────────────────────────

    fn build_registry(&self, task_id: &str) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for tool in self.deps.tools.arcs() {
            if self.agent.tools.iter().any(|n| n == tool.name()) {
                registry.register_arc(tool);
            }
        }
        if let Some(delegation) = &self.deps.delegation {
            if !self.agent.delegate_to.is_empty() {
                registry.register(DelegateTool::new(delegation.clone(), task_id.to_string()));
            }
        }
        registry
    }

    fn cancel_requested(&self, task_id: &str) -> bool {
        self.deps
            .scheduler
            .get(task_id)
            .map(|t| t.cancel_requested || t.status == TaskStatus::Cancelled)
            .unwrap_or(false)
    }

    fn checkpoint(
        &self,
        task_id: &str,
        session_id: &str,
        iteration: u32,
        status: &str,
        error_context: Option<String>,
    ) {
        if !self.deps.config.checkpoint.enabled {
            return;
        }
        let record = CheckpointRecord {
            task_id: task_id.to_string(),
            session_id: session_id.to_string(),
            iteration,
            status: status.to_string(),
            error_context,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.deps.store.save_checkpoint(&record) {
            warn!(task = task_id, error = %e, "checkpoint write failed");
        }
    }

    fn emit_error(&self, task_id: &str, message: &str) {
        self.deps.bus.publish(
            EventKind::Error,
            Some(task_id.to_string()),
            json!({ "message": message }),
        );
    }

    fn store_failure(&self, task_id: &str, iteration: u32, e: StoreError) -> LoopResult {
        self.emit_error(task_id, &format!("session store failure: {e}"));
        LoopResult::failed(iteration, "store_error")
    }
}

fn nudge_text(trigger: &str) -> String {
    match trigger {
        "repetitive_response" => "You appear to be repeating yourself without making progress. \
             Take a concrete action: call a tool, or finish the task and emit the completion marker."
            .to_string(),
        "repeated_tool_call" => "You have invoked the same tool with the same arguments several times. \
             The result will not change; try a different approach."
            .to_string(),
        "clarification_loop" => "No one can answer questions here. Make a reasonable assumption, \
             state it, and proceed with the task."
            .to_string(),
        other => format!("You seem to be stuck ({other}). Take a different concrete action."),
    }
}

/// On resume, rebuild the progress flags the completion validator needs by
/// replaying the persisted turn log: each assistant turn's calls pair with
/// the tool turns that follow it, a non-error tool turn marking success.
fn seed_progress_flags(session: &SessionRecord, registry: &ToolRegistry) -> (bool, bool) {
    let mut any_tool_executed = false;
    let mut any_write_succeeded = false;
    let turns = &session.turns;
    for (i, turn) in turns.iter().enumerate() {
        let Some(calls) = &turn.tool_calls else {
            continue;
        };
        for (j, call) in calls.iter().enumerate() {
            let Some(result_turn) = turns.get(i + 1 + j) else {
                continue;
            };
            if result_turn.role != sindri_model::Role::Tool {
                continue;
            }
            let succeeded = !result_turn.content.starts_with("error:");
            if succeeded {
                any_tool_executed = true;
                if registry.is_write_class(&call.name) {
                    any_write_succeeded = true;
                }
            }
        }
    }
    (any_tool_executed, any_write_succeeded)
}
