// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Task graph ownership and VRAM-aware batch selection.
//!
//! The scheduler owns every `Task`; other components hold ids and go
//! through this API.  Ready tasks are ordered by `(priority, created_at)`
//! — FIFO within a priority — and admitted into a batch greedily: a task
//! whose model is already resident costs zero marginal VRAM, otherwise it
//! must fit in the remaining budget.  A parent and its direct subtask are
//! never admitted into the same batch.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::bus::{EventBus, EventKind};
use crate::task::{Task, TaskId, TaskResult, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    priority: i32,
    created_at: DateTime<Utc>,
    seq: u64,
    id: TaskId,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    seq: u64,
}

pub struct Scheduler {
    bus: Arc<EventBus>,
    inner: Mutex<Inner>,
}

impl Scheduler {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a task and queue it for execution.
    pub fn add(&self, task: Task) -> TaskId {
        let mut inner = self.lock();
        let id = task.id.clone();
        inner.seq += 1;
        let entry = HeapEntry {
            priority: task.priority,
            created_at: task.created_at,
            seq: inner.seq,
            id: id.clone(),
        };
        inner.heap.push(Reverse(entry));
        inner.tasks.insert(id.clone(), task);
        drop(inner);
        self.bus.publish(EventKind::TaskCreated, Some(id.clone()), serde_json::json!({}));
        id
    }

    /// Snapshot of one task.
    pub fn get(&self, id: &str) -> Option<Task> {
        self.lock().tasks.get(id).cloned()
    }

    /// Snapshot of the whole task map.
    pub fn snapshot(&self) -> Vec<Task> {
        self.lock().tasks.values().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.lock()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Tasks in non-terminal states (pending, waiting, running, blocked).
    pub fn open_count(&self) -> usize {
        self.lock()
            .tasks
            .values()
            .filter(|t| !t.status.is_terminal())
            .count()
    }

    /// Select the next parallel batch.
    ///
    /// `remaining_budget_gb` is the VRAM still free; `loaded_models` seeds
    /// the running set, so tasks sharing a resident model are admitted at
    /// zero marginal cost.  Tasks that do not fit stay queued.  Selection
    /// is monotone: growing the headroom never deselects a task.
    pub fn ready_batch(&self, remaining_budget_gb: f64, loaded_models: &[String]) -> Vec<Task> {
        let mut inner = self.lock();
        let mut entries: Vec<HeapEntry> = Vec::with_capacity(inner.heap.len());
        while let Some(Reverse(entry)) = inner.heap.pop() {
            entries.push(entry);
        }

        let mut batch: Vec<Task> = Vec::new();
        let mut batch_ids: HashSet<TaskId> = HashSet::new();
        let mut loaded: HashSet<String> = loaded_models.iter().cloned().collect();
        let mut remaining = remaining_budget_gb;
        let mut keep: Vec<HeapEntry> = Vec::new();
        let mut status_changes: Vec<(TaskId, TaskStatus, TaskStatus)> = Vec::new();

        for entry in entries {
            let Some(task) = inner.tasks.get(&entry.id) else {
                continue;
            };
            if task.cancel_requested || task.status != TaskStatus::Pending {
                // Terminal, running, waiting, or cancelled entries leave the
                // queue; re-admission pushes a fresh entry.
                continue;
            }
            let dep_states: Vec<TaskStatus> = task
                .depends_on
                .iter()
                .filter_map(|d| inner.tasks.get(d).map(|t| t.status))
                .collect();
            if dep_states
                .iter()
                .any(|s| matches!(s, TaskStatus::Failed | TaskStatus::Cancelled))
            {
                // This dependency will never complete.
                let id = entry.id.clone();
                status_changes.push((id.clone(), task.status, TaskStatus::Blocked));
                if let Some(t) = inner.tasks.get_mut(&id) {
                    t.status = TaskStatus::Blocked;
                    t.updated_at = Utc::now();
                }
                keep.push(entry);
                continue;
            }
            if !dep_states.iter().all(|s| *s == TaskStatus::Complete) {
                keep.push(entry);
                continue;
            }
            // A parent and its direct subtask never share a batch.
            let related_in_batch = task
                .parent_id
                .as_ref()
                .map(|p| batch_ids.contains(p))
                .unwrap_or(false)
                || task.subtask_ids.iter().any(|c| batch_ids.contains(c));
            if related_in_batch {
                keep.push(entry);
                continue;
            }
            let admissible = if loaded.contains(&task.model_name) {
                true
            } else if remaining + f64::EPSILON >= task.vram_required {
                remaining -= task.vram_required;
                loaded.insert(task.model_name.clone());
                true
            } else {
                false
            };
            if admissible {
                batch_ids.insert(entry.id.clone());
                batch.push(task.clone());
            }
            // Selected tasks keep their entry until the caller transitions
            // them; stale entries are dropped lazily on the next pop.
            keep.push(entry);
        }

        for entry in keep {
            inner.heap.push(Reverse(entry));
        }
        drop(inner);
        for (id, from, to) in status_changes {
            self.publish_status(&id, from, to);
        }
        debug!(batch = batch.len(), "ready batch selected");
        batch
    }

    pub fn mark_running(&self, id: &str) {
        self.transition(id, TaskStatus::Running);
    }

    pub fn mark_waiting(&self, id: &str) {
        self.transition(id, TaskStatus::Waiting);
    }

    /// Re-queue a waiting parent after a child terminated.
    pub fn readmit(&self, id: &str) {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(id) else {
            return;
        };
        if task.status.is_terminal() {
            return;
        }
        let from = task.status;
        task.status = TaskStatus::Pending;
        task.updated_at = Utc::now();
        let entry = HeapEntry {
            priority: task.priority,
            created_at: task.created_at,
            seq: {
                inner.seq += 1;
                inner.seq
            },
            id: id.to_string(),
        };
        inner.heap.push(Reverse(entry));
        drop(inner);
        self.publish_status(id, from, TaskStatus::Pending);
    }

    /// Completion; a cancelled task stays cancelled.
    pub fn mark_completed(&self, id: &str, result: TaskResult) {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(id) else {
            return;
        };
        if task.status == TaskStatus::Cancelled {
            return;
        }
        let from = task.status;
        task.status = TaskStatus::Complete;
        task.result = Some(result);
        task.updated_at = Utc::now();
        drop(inner);
        self.publish_status(id, from, TaskStatus::Complete);
    }

    /// Failure; cancellation always wins over FAILED.
    pub fn mark_failed(&self, id: &str, error: impl Into<String>) {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(id) else {
            return;
        };
        if task.status == TaskStatus::Cancelled {
            return;
        }
        let from = task.status;
        task.status = TaskStatus::Failed;
        task.result = Some(TaskResult {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        });
        task.updated_at = Utc::now();
        drop(inner);
        self.publish_status(id, from, TaskStatus::Failed);
    }

    pub fn mark_cancelled(&self, id: &str) {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(id) else {
            return;
        };
        if task.status == TaskStatus::Cancelled {
            return;
        }
        let from = task.status;
        task.cancel_requested = true;
        task.status = TaskStatus::Cancelled;
        task.updated_at = Utc::now();
        drop(inner);
        self.publish_status(id, from, TaskStatus::Cancelled);
        self.bus
            .publish(EventKind::TaskCancelled, Some(id.to_string()), serde_json::json!({}));
    }

    /// Request cancellation of a task and every descendant.  Running tasks
    /// honor the flag at their next check; queued tasks are finalized here.
    pub fn cancel_subtree(&self, id: &str) {
        let mut finalized: Vec<(TaskId, TaskStatus)> = Vec::new();
        {
            let mut inner = self.lock();
            let mut stack = vec![id.to_string()];
            while let Some(tid) = stack.pop() {
                let Some(task) = inner.tasks.get_mut(&tid) else {
                    continue;
                };
                task.cancel_requested = true;
                stack.extend(task.subtask_ids.iter().cloned());
                if !task.status.is_terminal() && task.status != TaskStatus::Running {
                    let from = task.status;
                    task.status = TaskStatus::Cancelled;
                    task.updated_at = Utc::now();
                    finalized.push((tid, from));
                }
            }
        }
        for (tid, from) in finalized {
            self.publish_status(&tid, from, TaskStatus::Cancelled);
            self.bus
                .publish(EventKind::TaskCancelled, Some(tid), serde_json::json!({}));
        }
    }

    /// Assign the session id — at most once; later calls are ignored.
    pub fn set_session_id(&self, id: &str, session_id: &str) {
        let mut inner = self.lock();
        if let Some(task) = inner.tasks.get_mut(id) {
            if task.session_id.is_none() {
                task.session_id = Some(session_id.to_string());
                task.updated_at = Utc::now();
            }
        }
    }

    /// Recovery path only: the recorded session could not be loaded and a
    /// replacement was created.  Normal flows must use
    /// [`Self::set_session_id`], which never reassigns.
    pub fn replace_session_id(&self, id: &str, session_id: &str) {
        let mut inner = self.lock();
        if let Some(task) = inner.tasks.get_mut(id) {
            task.session_id = Some(session_id.to_string());
            task.updated_at = Utc::now();
        }
    }

    pub fn link_subtask(&self, parent_id: &str, child_id: &str) {
        let mut inner = self.lock();
        if let Some(parent) = inner.tasks.get_mut(parent_id) {
            if !parent.subtask_ids.iter().any(|c| c == child_id) {
                parent.subtask_ids.push(child_id.to_string());
            }
        }
    }

    /// Number of parent hops above `id`.
    pub fn depth_of(&self, id: &str) -> usize {
        let inner = self.lock();
        let mut depth = 0;
        let mut current = inner.tasks.get(id).and_then(|t| t.parent_id.clone());
        while let Some(pid) = current {
            depth += 1;
            current = inner.tasks.get(&pid).and_then(|t| t.parent_id.clone());
            if depth > inner.tasks.len() {
                break; // defensive bound; parent links should form a tree
            }
        }
        depth
    }

    /// Agent names along the ancestor chain of `id`, nearest first.
    pub fn ancestor_agents(&self, id: &str) -> Vec<String> {
        let inner = self.lock();
        let mut agents = Vec::new();
        let mut current = inner.tasks.get(id).cloned();
        while let Some(task) = current {
            agents.push(task.assigned_agent.clone());
            current = task
                .parent_id
                .as_ref()
                .and_then(|pid| inner.tasks.get(pid).cloned());
            if agents.len() > inner.tasks.len() {
                break;
            }
        }
        agents
    }

    fn transition(&self, id: &str, to: TaskStatus) {
        let mut inner = self.lock();
        let Some(task) = inner.tasks.get_mut(id) else {
            return;
        };
        let from = task.status;
        if from == to {
            return;
        }
        task.status = to;
        task.updated_at = Utc::now();
        drop(inner);
        self.publish_status(id, from, to);
    }

    fn publish_status(&self, id: &str, from: TaskStatus, to: TaskStatus) {
        self.bus.publish(
            EventKind::TaskStatusChanged,
            Some(id.to_string()),
            serde_json::json!({ "from": from, "to": to }),
        );
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use sindri_config::AgentDefinition;

    fn agent(name: &str, model: &str, vram: f64) -> AgentDefinition {
        serde_yaml::from_str(&format!(
            "name: {name}\nmodel: {model}\nvram_gb: {vram}\nprompt: p\n"
        ))
        .unwrap()
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(Arc::new(EventBus::new()))
    }

    fn task(agent_name: &str, model: &str, vram: f64) -> Task {
        Task::for_agent("work", &agent(agent_name, model, vram), 10)
    }

    #[test]
    fn batch_orders_by_priority_then_fifo() {
        let s = scheduler();
        let low = s.add(task("a", "m1", 1.0).with_priority(20));
        let first = s.add(task("b", "m1", 1.0).with_priority(5));
        let second = s.add(task("c", "m1", 1.0).with_priority(5));
        let batch = s.ready_batch(100.0, &[]);
        let ids: Vec<&str> = batch.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![first.as_str(), second.as_str(), low.as_str()]);
    }

    #[test]
    fn dependencies_gate_readiness() {
        let s = scheduler();
        let dep = s.add(task("a", "m1", 1.0));
        let gated = s.add(task("b", "m2", 1.0).with_dependencies(vec![dep.clone()]));
        let batch = s.ready_batch(100.0, &[]);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, dep);

        s.mark_running(&dep);
        s.mark_completed(
            &dep,
            TaskResult {
                success: true,
                output: String::new(),
                error: None,
            },
        );
        let batch = s.ready_batch(100.0, &[]);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, gated);
    }

    #[test]
    fn failed_dependency_blocks_dependent() {
        let s = scheduler();
        let dep = s.add(task("a", "m1", 1.0));
        let gated = s.add(task("b", "m2", 1.0).with_dependencies(vec![dep.clone()]));
        s.mark_failed(&dep, "boom");
        let batch = s.ready_batch(100.0, &[]);
        assert!(batch.is_empty());
        assert_eq!(s.get(&gated).unwrap().status, TaskStatus::Blocked);
    }

    #[test]
    fn vram_budget_limits_batch() {
        // Scenario: 16 GB total, 2 reserved → 14 usable.  Two 5 GB models
        // fit; the 10 GB model must wait.
        let s = scheduler();
        let a = s.add(task("a", "m5a", 5.0));
        let b = s.add(task("b", "m5b", 5.0));
        let c = s.add(task("c", "m10", 10.0));
        let batch = s.ready_batch(14.0, &[]);
        let ids: Vec<&str> = batch.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![a.as_str(), b.as_str()]);

        // The big task is still queued for a later batch.
        for t in &batch {
            s.mark_running(&t.id);
        }
        let later = s.ready_batch(10.0, &[]);
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].id, c);
    }

    #[test]
    fn shared_model_costs_zero_marginal_vram() {
        let s = scheduler();
        s.add(task("a", "shared", 8.0));
        s.add(task("b", "shared", 8.0));
        // Budget fits one load; both tasks run because they share it.
        let batch = s.ready_batch(8.0, &[]);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn already_loaded_model_admits_with_zero_budget() {
        let s = scheduler();
        s.add(task("a", "resident", 8.0));
        let batch = s.ready_batch(0.0, &["resident".to_string()]);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn batch_selection_is_monotone_in_headroom() {
        let s = scheduler();
        for i in 0..4 {
            s.add(task(&format!("a{i}"), &format!("m{i}"), 4.0));
        }
        let small: Vec<TaskId> = s
            .ready_batch(8.0, &[])
            .into_iter()
            .map(|t| t.id)
            .collect();
        // Nothing was marked running, so re-selection with more headroom
        // must include everything the smaller budget selected.
        let large: Vec<TaskId> = s
            .ready_batch(16.0, &[])
            .into_iter()
            .map(|t| t.id)
            .collect();
        for id in &small {
            assert!(large.contains(id), "task {id} dropped by larger budget");
        }
        assert!(large.len() > small.len());
    }

    #[test]
    fn parent_and_child_never_share_a_batch() {
        let s = scheduler();
        let parent = s.add(task("p", "m1", 1.0));
        let mut child = task("c", "m2", 1.0);
        child.parent_id = Some(parent.clone());
        let child_id = s.add(child);
        s.link_subtask(&parent, &child_id);
        let batch = s.ready_batch(100.0, &[]);
        assert_eq!(batch.len(), 1, "only one side of the edge may run");
    }

    #[test]
    fn cancel_subtree_flags_descendants() {
        let s = scheduler();
        let root = s.add(task("p", "m1", 1.0));
        let mut mid_task = task("c", "m1", 1.0);
        mid_task.parent_id = Some(root.clone());
        let mid = s.add(mid_task);
        s.link_subtask(&root, &mid);
        let mut leaf_task = task("g", "m1", 1.0);
        leaf_task.parent_id = Some(mid.clone());
        let leaf = s.add(leaf_task);
        s.link_subtask(&mid, &leaf);

        s.mark_running(&root);
        s.cancel_subtree(&root);

        // Running root only gets the flag; queued descendants finalize.
        let root_t = s.get(&root).unwrap();
        assert!(root_t.cancel_requested);
        assert_eq!(root_t.status, TaskStatus::Running);
        assert_eq!(s.get(&mid).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(s.get(&leaf).unwrap().status, TaskStatus::Cancelled);

        // Cancelled tasks never enter a batch.
        assert!(s.ready_batch(100.0, &[]).is_empty());
    }

    #[test]
    fn cancelled_task_is_not_overwritten_by_failed() {
        let s = scheduler();
        let id = s.add(task("a", "m1", 1.0));
        s.mark_cancelled(&id);
        s.mark_failed(&id, "late failure");
        assert_eq!(s.get(&id).unwrap().status, TaskStatus::Cancelled);
        // And not by completion either.
        s.mark_completed(
            &id,
            TaskResult {
                success: true,
                output: String::new(),
                error: None,
            },
        );
        assert_eq!(s.get(&id).unwrap().status, TaskStatus::Cancelled);
    }

    #[test]
    fn session_id_is_assigned_at_most_once() {
        let s = scheduler();
        let id = s.add(task("a", "m1", 1.0));
        s.set_session_id(&id, "first");
        s.set_session_id(&id, "second");
        assert_eq!(s.get(&id).unwrap().session_id.as_deref(), Some("first"));
    }

    #[test]
    fn readmit_requeues_waiting_parent() {
        let s = scheduler();
        let id = s.add(task("a", "m1", 1.0));
        let _ = s.ready_batch(100.0, &[]);
        s.mark_running(&id);
        s.mark_waiting(&id);
        assert!(s.ready_batch(100.0, &[]).is_empty());
        s.readmit(&id);
        let batch = s.ready_batch(100.0, &[]);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
    }

    #[test]
    fn depth_and_ancestors_walk_parent_chain() {
        let s = scheduler();
        let root = s.add(task("orchestrator", "m1", 1.0));
        let mut mid_task = task("coder", "m1", 1.0);
        mid_task.parent_id = Some(root.clone());
        let mid = s.add(mid_task);
        let mut leaf_task = task("reviewer", "m1", 1.0);
        leaf_task.parent_id = Some(mid.clone());
        let leaf = s.add(leaf_task);

        assert_eq!(s.depth_of(&root), 0);
        assert_eq!(s.depth_of(&leaf), 2);
        assert_eq!(
            s.ancestor_agents(&leaf),
            vec!["reviewer", "coder", "orchestrator"]
        );
    }

    #[test]
    fn pending_count_tracks_queue() {
        let s = scheduler();
        assert_eq!(s.pending_count(), 0);
        let id = s.add(task("a", "m1", 1.0));
        assert_eq!(s.pending_count(), 1);
        s.mark_running(&id);
        assert_eq!(s.pending_count(), 0);
        assert_eq!(s.open_count(), 1);
    }
}
