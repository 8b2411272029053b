// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sindri_config::AgentDefinition;

pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Planning,
    Running,
    /// Paused while one or more delegated subtasks run.
    Waiting,
    /// Dependencies cannot be satisfied yet.
    Blocked,
    Complete,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

/// One unit of work, assigned to exactly one agent.
///
/// Tasks are owned by the scheduler's task map; everything else refers to
/// them by id.  `cancel_requested` only ever moves from false to true, and
/// `session_id` is assigned at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub description: String,
    pub assigned_agent: String,
    /// Lower is more urgent.
    pub priority: i32,
    pub status: TaskStatus,
    pub session_id: Option<String>,
    pub parent_id: Option<TaskId>,
    pub subtask_ids: Vec<TaskId>,
    pub depends_on: Vec<TaskId>,
    pub vram_required: f64,
    pub model_name: String,
    pub max_iterations: u32,
    pub cancel_requested: bool,
    pub result: Option<TaskResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a task for an agent, taking model/VRAM/iteration settings from
    /// its definition.
    pub fn for_agent(
        description: impl Into<String>,
        agent: &AgentDefinition,
        default_max_iterations: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            assigned_agent: agent.name.clone(),
            priority: 10,
            status: TaskStatus::Pending,
            session_id: None,
            parent_id: None,
            subtask_ids: Vec::new(),
            depends_on: Vec::new(),
            vram_required: agent.vram_gb,
            model_name: agent.model.clone(),
            max_iterations: agent.max_iterations.unwrap_or(default_max_iterations),
            cancel_requested: false,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.depends_on = deps;
        self
    }
}

/// What the agent loop decided about its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    Completed,
    Failed,
    /// The task delegated work and must wait for the child.
    DelegationWaiting,
}

#[derive(Debug, Clone)]
pub struct LoopResult {
    pub outcome: LoopOutcome,
    pub iterations: u32,
    pub reason: String,
    pub final_output: String,
}

impl LoopResult {
    pub fn completed(iterations: u32, final_output: impl Into<String>) -> Self {
        Self {
            outcome: LoopOutcome::Completed,
            iterations,
            reason: "complete".into(),
            final_output: final_output.into(),
        }
    }

    pub fn failed(iterations: u32, reason: impl Into<String>) -> Self {
        Self {
            outcome: LoopOutcome::Failed,
            iterations,
            reason: reason.into(),
            final_output: String::new(),
        }
    }

    pub fn delegation_waiting(iterations: u32) -> Self {
        Self {
            outcome: LoopOutcome::DelegationWaiting,
            iterations,
            reason: "delegation_waiting".into(),
            final_output: String::new(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
