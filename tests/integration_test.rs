// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Whole-system integration: compose the kernel the way the CLI does, run
//! a fleet against the scripted backend, and verify what survives on disk.

use std::sync::Arc;

use serde_json::json;

use sindri_config::{AgentRegistry, Config};
use sindri_core::{EventBus, Orchestrator, Services, COMPLETION_MARKER};
use sindri_memory::{ContextBuilder, HashingEmbedder, InMemoryIndex};
use sindri_model::{ModelManager, ScriptedBackend, ScriptedResponse};
use sindri_store::SessionStore;
use sindri_tools::{ReadFileTool, ToolRegistry, WriteFileTool};

const AGENTS: &str = r#"
agents:
  coder:
    model: coder-model
    vram_gb: 4.0
    tools: [write_file, read_file]
    prompt: You write code.
    max_iterations: 6
"#;

fn compose(
    backend: ScriptedBackend,
    store: Arc<SessionStore>,
    agents_yaml: &str,
) -> (Services, Arc<ScriptedBackend>) {
    let mut config = Config::default();
    config.retry.base_ms = 1;
    config.retry.max_ms = 2;

    let dir = tempfile::tempdir().unwrap();
    let agents_path = dir.path().join("agents.yaml");
    std::fs::write(&agents_path, agents_yaml).unwrap();
    let agents = Arc::new(AgentRegistry::load_file(&agents_path).unwrap());

    let backend = Arc::new(backend);
    let memory = Arc::new(ContextBuilder::new(
        store.clone(),
        Arc::new(InMemoryIndex::new()),
        Arc::new(HashingEmbedder::default()),
        config.memory_tier_shares.clone(),
    ));
    let models = Arc::new(ModelManager::new(backend.clone(), 32.0, 0.0));
    let mut tools = ToolRegistry::new();
    tools.register(WriteFileTool);
    tools.register(ReadFileTool);

    let services = Services {
        config: Arc::new(config),
        agents,
        backend: backend.clone(),
        models,
        tools: Arc::new(tools),
        store,
        memory,
        bus: Arc::new(EventBus::new()),
    };
    (services, backend)
}

#[tokio::test]
async fn completed_run_persists_session_and_clears_checkpoint() {
    let db_dir = tempfile::tempdir().unwrap();
    let db_path = db_dir.path().join("sindri.db");
    let work_dir = tempfile::tempdir().unwrap();

    let root_id;
    {
        let store = Arc::new(SessionStore::open(&db_path).unwrap());
        let (services, _) = compose(
            ScriptedBackend::new(vec![
                ScriptedResponse::text("writing").with_tool_call(
                    "c1",
                    "write_file",
                    json!({"path": "hello.txt", "content": "hi"}),
                ),
                ScriptedResponse::text(format!("done {COMPLETION_MARKER}")),
            ]),
            store,
            AGENTS,
        );
        let orch = Orchestrator::new(services, "itest", work_dir.path().to_path_buf());
        let result = orch.run_root_task("write hello.txt", "coder").await.unwrap();
        assert!(result.success);
        root_id = orch.scheduler().snapshot()[0].id.clone();
    }

    // Reopen the store cold, as a crashed-and-restarted process would.
    let store = SessionStore::open(&db_path).unwrap();
    store.integrity_check().unwrap();
    assert!(
        store.list_checkpoints().unwrap().is_empty(),
        "completed tasks leave no checkpoints"
    );
    assert!(store.load_checkpoint(&root_id).unwrap().is_none());
    let episodes = store.episodes_for_project("itest", 10).unwrap();
    assert!(
        episodes.iter().any(|e| e.event_type == "task_completed"),
        "episodic memory recorded the outcome"
    );
}

#[tokio::test]
async fn failed_run_leaves_resumable_checkpoint_on_disk() {
    let db_dir = tempfile::tempdir().unwrap();
    let db_path = db_dir.path().join("sindri.db");
    let work_dir = tempfile::tempdir().unwrap();

    {
        let store = Arc::new(SessionStore::open(&db_path).unwrap());
        // Six distinct marker-free turns: the coder burns its budget.
        let scripts = (0..6)
            .map(|i| {
                ScriptedResponse::text(format!(
                    "iteration {i} considers a wholly different angle {}",
                    i * 13
                ))
            })
            .collect();
        let (services, _) = compose(ScriptedBackend::new(scripts), store, AGENTS);
        let orch = Orchestrator::new(services, "itest", work_dir.path().to_path_buf());
        let result = orch.run_root_task("impossible ask", "coder").await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("max_iterations_reached"));
    }

    let store = SessionStore::open(&db_path).unwrap();
    store.integrity_check().unwrap();
    let checkpoints = store.list_checkpoints().unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].status, "failed");
    assert_eq!(
        checkpoints[0].error_context.as_deref(),
        Some("max_iterations_reached")
    );
    // The session the checkpoint points at is loadable and non-empty.
    let session = store.load_session(&checkpoints[0].session_id).unwrap();
    assert!(!session.turns.is_empty());
}
