// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Parent ↔ child task lifecycle.
//!
//! A delegating agent calls the `delegate` tool; that builds a child task
//! for the target agent, queues it, pre-warms the child's model, and parks
//! the parent in WAITING.  When the child terminates, its outcome is
//! injected into the parent session as a tool turn and the parent is
//! re-admitted to the scheduler.  Rejections (whitelist, cycle, depth) are
//! AGENT-class tool failures the parent model sees and can react to.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use sindri_config::AgentRegistry;
use sindri_model::{ModelManager, Turn};
use sindri_store::SessionStore;
use sindri_tools::{Tool, ToolResult};

use crate::bus::{EventBus, EventKind};
use crate::scheduler::Scheduler;
use crate::task::{Task, TaskId, TaskStatus};

pub const DELEGATE_TOOL_NAME: &str = "delegate";

pub struct DelegationManager {
    scheduler: Arc<Scheduler>,
    agents: Arc<AgentRegistry>,
    models: Arc<ModelManager>,
    store: Arc<SessionStore>,
    bus: Arc<EventBus>,
    max_depth: usize,
    default_max_iterations: u32,
}

impl DelegationManager {
    pub fn new(
        scheduler: Arc<Scheduler>,
        agents: Arc<AgentRegistry>,
        models: Arc<ModelManager>,
        store: Arc<SessionStore>,
        bus: Arc<EventBus>,
        max_depth: usize,
        default_max_iterations: u32,
    ) -> Self {
        Self {
            scheduler,
            agents,
            models,
            store,
            bus,
            max_depth,
            default_max_iterations,
        }
    }

    /// Create a child task for `target_agent` and pause the parent.
    ///
    /// Returns the child task id, or a human-readable rejection that the
    /// caller surfaces to the model as a failed tool result.
    pub async fn delegate(
        &self,
        parent_id: &str,
        target_agent: &str,
        description: &str,
        context: Option<&str>,
    ) -> Result<TaskId, String> {
        let parent = self
            .scheduler
            .get(parent_id)
            .ok_or_else(|| format!("unknown parent task: {parent_id}"))?;

        if !self.agents.may_delegate(&parent.assigned_agent, target_agent) {
            return Err(format!(
                "agent '{}' is not allowed to delegate to '{target_agent}'",
                parent.assigned_agent
            ));
        }
        let depth = self.scheduler.depth_of(parent_id) + 1;
        if depth > self.max_depth {
            return Err(format!(
                "delegation depth limit reached ({} levels); finish this task yourself",
                self.max_depth
            ));
        }
        if self
            .scheduler
            .ancestor_agents(parent_id)
            .iter()
            .any(|a| a == target_agent)
        {
            return Err(format!(
                "delegation to '{target_agent}' would create a cycle with an ancestor task"
            ));
        }
        let def = self
            .agents
            .get(target_agent)
            .ok_or_else(|| format!("unknown agent: {target_agent}"))?;

        let full_description = match context {
            Some(ctx) if !ctx.is_empty() => {
                format!("{description}\n\nContext from the delegating agent:\n{ctx}")
            }
            _ => description.to_string(),
        };
        let mut child = Task::for_agent(full_description, def, self.default_max_iterations)
            .with_priority(parent.priority);
        child.parent_id = Some(parent_id.to_string());
        let child_id = self.scheduler.add(child);
        self.scheduler.link_subtask(parent_id, &child_id);

        // Get the child's model warming while the parent winds down.
        self.models.prewarm(def.model.clone(), def.vram_gb).await;

        self.bus.publish(
            EventKind::DelegationStart,
            Some(parent_id.to_string()),
            json!({ "child_task_id": child_id, "target_agent": target_agent, "depth": depth }),
        );
        self.scheduler.mark_waiting(parent_id);
        debug!(parent = parent_id, child = %child_id, target_agent, "delegated");
        Ok(child_id)
    }

    /// Inject the child's success into the parent session and wake the
    /// parent up.
    pub fn on_child_completed(&self, child: &Task) {
        let output = child
            .result
            .as_ref()
            .map(|r| r.output.clone())
            .unwrap_or_default();
        let summary = format!(
            "Delegated task {} (agent '{}') completed successfully.\nOutput:\n{output}",
            child.id, child.assigned_agent
        );
        self.notify_parent(child, summary);
    }

    /// Inject the child's failure; the parent decides whether that is
    /// fatal for its own task.
    pub fn on_child_failed(&self, child: &Task, error: &str) {
        let summary = format!(
            "Delegated task {} (agent '{}') FAILED: {error}\n\
             Decide whether to retry differently, work around it, or give up.",
            child.id, child.assigned_agent
        );
        self.notify_parent(child, summary);
    }

    fn notify_parent(&self, child: &Task, summary: String) {
        let Some(parent_id) = &child.parent_id else {
            return;
        };
        let Some(parent) = self.scheduler.get(parent_id) else {
            return;
        };
        if parent.status == TaskStatus::Cancelled || parent.cancel_requested {
            debug!(parent = %parent_id, "parent cancelled; not re-admitting");
            return;
        }
        if let Some(session_id) = &parent.session_id {
            if let Err(e) = self.store.append_turn(session_id, &Turn::tool(&summary)) {
                warn!(session = %session_id, error = %e, "failed to inject child outcome");
            }
        }
        self.scheduler.readmit(parent_id);
    }
}

/// The tool surface agents use to delegate.  Each running task gets its own
/// instance bound to its task id.
pub struct DelegateTool {
    manager: Arc<DelegationManager>,
    parent_task_id: TaskId,
}

impl DelegateTool {
    pub fn new(manager: Arc<DelegationManager>, parent_task_id: TaskId) -> Self {
        Self {
            manager,
            parent_task_id,
        }
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        DELEGATE_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Hand a focused subtask to another agent and pause until it finishes. \
         The child's outcome is injected into this conversation as a tool \
         result when you resume."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent": {
                    "type": "string",
                    "description": "Name of the agent to delegate to (must be in your delegation whitelist)"
                },
                "description": {
                    "type": "string",
                    "description": "What the child task should accomplish"
                },
                "context": {
                    "type": "string",
                    "description": "Optional background the child needs (findings so far, file paths, constraints)"
                }
            },
            "required": ["agent", "description"]
        })
    }

    async fn execute(&self, args: &Value, _work_dir: &Path) -> ToolResult {
        let Some(agent) = args.get("agent").and_then(Value::as_str) else {
            return ToolResult::agent_error("missing required parameter 'agent'");
        };
        let Some(description) = args.get("description").and_then(Value::as_str) else {
            return ToolResult::agent_error("missing required parameter 'description'");
        };
        let context = args.get("context").and_then(Value::as_str);
        match self
            .manager
            .delegate(&self.parent_task_id, agent, description, context)
            .await
        {
            Ok(child_id) => ToolResult::ok(format!(
                "Delegated to agent '{agent}' as task {child_id}. \
                 This task pauses until the subtask finishes."
            )),
            Err(reason) => ToolResult::agent_error(reason),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use sindri_model::ScriptedBackend;
    use crate::task::TaskResult;

    const AGENTS: &str = r#"
agents:
  orchestrator:
    model: big
    vram_gb: 8.0
    prompt: orchestrate
    delegate_to: [coder, reviewer]
  coder:
    model: mid
    vram_gb: 4.0
    prompt: code
    delegate_to: [reviewer]
  reviewer:
    model: small
    vram_gb: 2.0
    prompt: review
    delegate_to: [coder]
"#;

    struct Fixture {
        scheduler: Arc<Scheduler>,
        store: Arc<SessionStore>,
        manager: Arc<DelegationManager>,
    }

    fn fixture(max_depth: usize) -> Fixture {
        let bus = Arc::new(EventBus::new());
        let scheduler = Arc::new(Scheduler::new(bus.clone()));
        let dir = tempfile::tempdir().unwrap();
        let agents_path = dir.path().join("agents.yaml");
        std::fs::write(&agents_path, AGENTS).unwrap();
        let agents = Arc::new(AgentRegistry::load_file(&agents_path).unwrap());
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let models = Arc::new(ModelManager::new(backend, 32.0, 0.0));
        let store = Arc::new(SessionStore::open_in_memory().unwrap());
        let manager = Arc::new(DelegationManager::new(
            scheduler.clone(),
            agents,
            models,
            store.clone(),
            bus,
            max_depth,
            10,
        ));
        Fixture {
            scheduler,
            store,
            manager,
        }
    }

    fn add_task(f: &Fixture, agent: &str, parent: Option<&str>) -> TaskId {
        let def: sindri_config::AgentDefinition = serde_yaml::from_str(&format!(
            "name: {agent}\nmodel: m\nvram_gb: 1.0\nprompt: p\n"
        ))
        .unwrap();
        let mut t = Task::for_agent("parent work", &def, 10);
        t.assigned_agent = agent.to_string();
        if let Some(p) = parent {
            t.parent_id = Some(p.to_string());
        }
        let id = f.scheduler.add(t);
        if let Some(p) = parent {
            f.scheduler.link_subtask(p, &id);
        }
        id
    }

    #[tokio::test]
    async fn delegate_creates_child_and_pauses_parent() {
        let f = fixture(5);
        let parent = add_task(&f, "orchestrator", None);
        f.scheduler.mark_running(&parent);
        let child_id = f
            .manager
            .delegate(&parent, "coder", "write the parser", None)
            .await
            .unwrap();

        let child = f.scheduler.get(&child_id).unwrap();
        assert_eq!(child.assigned_agent, "coder");
        assert_eq!(child.model_name, "mid");
        assert_eq!(child.parent_id.as_deref(), Some(parent.as_str()));

        let parent_task = f.scheduler.get(&parent).unwrap();
        assert_eq!(parent_task.status, TaskStatus::Waiting);
        assert!(parent_task.subtask_ids.contains(&child_id));
    }

    #[tokio::test]
    async fn rejects_target_outside_whitelist() {
        let f = fixture(5);
        let parent = add_task(&f, "coder", None);
        let err = f
            .manager
            .delegate(&parent, "orchestrator", "x", None)
            .await
            .unwrap_err();
        assert!(err.contains("not allowed"));
    }

    #[tokio::test]
    async fn rejects_unknown_agent() {
        let f = fixture(5);
        let parent = add_task(&f, "orchestrator", None);
        let err = f
            .manager
            .delegate(&parent, "nonexistent", "x", None)
            .await
            .unwrap_err();
        assert!(err.contains("not allowed"));
    }

    #[tokio::test]
    async fn rejects_beyond_max_depth() {
        let f = fixture(1);
        let root = add_task(&f, "orchestrator", None);
        let mid = add_task(&f, "coder", Some(&root));
        // mid is at depth 1 == max_depth; one more level is rejected.
        let err = f
            .manager
            .delegate(&mid, "reviewer", "x", None)
            .await
            .unwrap_err();
        assert!(err.contains("depth limit"));
    }

    #[tokio::test]
    async fn rejects_delegation_cycle() {
        let f = fixture(5);
        let root = add_task(&f, "coder", None);
        // coder → reviewer is whitelisted, but the ancestor chain already
        // contains "coder"; a reviewer→coder delegation would ping-pong.
        let child = add_task(&f, "reviewer", Some(&root));
        let err = f
            .manager
            .delegate(&child, "coder", "x", None)
            .await
            .unwrap_err();
        assert!(err.contains("cycle"));
    }

    #[tokio::test]
    async fn child_completion_injects_turn_and_readmits_parent() {
        let f = fixture(5);
        let parent = add_task(&f, "orchestrator", None);
        let session = f.store.create_session("parent work", "big").unwrap();
        f.scheduler.set_session_id(&parent, &session.id);
        f.scheduler.mark_running(&parent);

        let child_id = f
            .manager
            .delegate(&parent, "reviewer", "review it", Some("look at lib.rs"))
            .await
            .unwrap();
        let mut child = f.scheduler.get(&child_id).unwrap();
        child.result = Some(TaskResult {
            success: true,
            output: "looks good".into(),
            error: None,
        });

        f.manager.on_child_completed(&child);

        let parent_task = f.scheduler.get(&parent).unwrap();
        assert_eq!(parent_task.status, TaskStatus::Pending);
        let loaded = f.store.load_session(&session.id).unwrap();
        let tool_turn = loaded
            .turns
            .iter()
            .find(|t| t.role == sindri_model::Role::Tool)
            .expect("tool turn injected");
        assert!(tool_turn.content.contains(&child_id));
        assert!(tool_turn.content.contains("looks good"));
    }

    #[tokio::test]
    async fn child_failure_injects_error_turn() {
        let f = fixture(5);
        let parent = add_task(&f, "orchestrator", None);
        let session = f.store.create_session("parent work", "big").unwrap();
        f.scheduler.set_session_id(&parent, &session.id);
        f.scheduler.mark_running(&parent);

        let child_id = f
            .manager
            .delegate(&parent, "coder", "build it", None)
            .await
            .unwrap();
        let child = f.scheduler.get(&child_id).unwrap();
        f.manager.on_child_failed(&child, "max_iterations_reached");

        let loaded = f.store.load_session(&session.id).unwrap();
        assert!(loaded
            .turns
            .iter()
            .any(|t| t.content.contains("FAILED") && t.content.contains("max_iterations_reached")));
        assert_eq!(f.scheduler.get(&parent).unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn cancelled_parent_is_not_readmitted() {
        let f = fixture(5);
        let parent = add_task(&f, "orchestrator", None);
        f.scheduler.mark_running(&parent);
        let child_id = f
            .manager
            .delegate(&parent, "coder", "build", None)
            .await
            .unwrap();
        f.scheduler.cancel_subtree(&parent);
        let child = f.scheduler.get(&child_id).unwrap();
        f.manager.on_child_completed(&child);
        // Waiting + cancel_subtree finalizes the parent to Cancelled, and
        // the completion notification must not resurrect it.
        assert_eq!(
            f.scheduler.get(&parent).unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn delegate_tool_surfaces_rejection_as_agent_error() {
        let f = fixture(5);
        let parent = add_task(&f, "reviewer", None);
        let tool = DelegateTool::new(f.manager.clone(), parent);
        let out = tool
            .execute(
                &json!({"agent": "coder", "description": "x"}),
                Path::new("."),
            )
            .await;
        assert!(!out.success);
        assert_eq!(
            out.category,
            Some(sindri_model::ErrorCategory::Agent)
        );
    }
}
