// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};
use sindri_config::AgentRegistry;
use sindri_core::{EventBus, EventKind, Orchestrator, Services};
use sindri_memory::{ContextBuilder, HashingEmbedder, InMemoryIndex, ProjectIndexer};
use sindri_model::{LlmBackend, MockBackend, ModelManager};
use sindri_store::SessionStore;
use sindri_tools::{
    HttpFetchTool, ListDirTool, ReadFileTool, ShellTool, ToolRegistry, WriteFileTool,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match &cli.command {
        Commands::ShowConfig => {
            let config = sindri_config::load(cli.config.as_deref())?;
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            Ok(())
        }
        Commands::CheckStore { store } => {
            let store = SessionStore::open(store)?;
            store.integrity_check()?;
            println!("store is healthy");
            Ok(())
        }
        Commands::Checkpoints { store } => {
            let store = SessionStore::open(store)?;
            for cp in store.list_checkpoints()? {
                println!(
                    "{}  iteration {}  [{}]  session {}",
                    cp.task_id, cp.iteration, cp.status, cp.session_id
                );
            }
            Ok(())
        }
        Commands::Run {
            task,
            agent,
            agents,
            store,
            work_dir,
            index,
        } => {
            let config = Arc::new(sindri_config::load(cli.config.as_deref())?);
            run_task(
                &config,
                task,
                agent,
                agents,
                store,
                work_dir.clone(),
                *index,
            )
            .await
        }
    }
}

async fn run_task(
    config: &Arc<sindri_config::Config>,
    task: &str,
    agent: &str,
    agents_path: &PathBuf,
    store_path: &PathBuf,
    work_dir: Option<PathBuf>,
    index: bool,
) -> anyhow::Result<()> {
    let agents = Arc::new(load_agents(agents_path)?);
    anyhow::ensure!(!agents.is_empty(), "no agent definitions found");

    let store = if config.checkpoint.enabled {
        if let Some(parent) = store_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        Arc::new(SessionStore::open(store_path)?)
    } else {
        Arc::new(SessionStore::open_in_memory()?)
    };
    store.integrity_check().context("store failed integrity check")?;

    // The transport is pluggable; the built-in mock backend makes dry runs
    // possible without a model server.  Real deployments construct the
    // kernel through the library API with their own `LlmBackend`.
    let backend: Arc<dyn LlmBackend> = Arc::new(MockBackend);

    let models = Arc::new(ModelManager::new(
        backend.clone(),
        config.total_vram_gb,
        config.reserve_vram_gb,
    ));
    let embedder = Arc::new(HashingEmbedder::default());
    let vector_index = Arc::new(InMemoryIndex::new());
    let memory = Arc::new(ContextBuilder::new(
        store.clone(),
        vector_index.clone(),
        embedder.clone(),
        config.memory_tier_shares.clone(),
    ));

    let mut tools = ToolRegistry::new();
    tools.register(WriteFileTool);
    tools.register(ReadFileTool);
    tools.register(ListDirTool);
    tools.register(ShellTool::default());
    tools.register(HttpFetchTool::default());

    let bus = Arc::new(EventBus::new());
    let events = bus.subscribe();

    let work_dir = match work_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let project_id = work_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "default".to_string());

    if index {
        let indexer = ProjectIndexer::new(store.clone(), vector_index, embedder);
        let files = indexer.index_project(&project_id, &work_dir).await?;
        tracing::info!(files, "project indexed");
    }

    let services = Services {
        config: config.clone(),
        agents,
        backend,
        models,
        tools: Arc::new(tools),
        store,
        memory,
        bus,
    };
    let orchestrator = Orchestrator::new(services, project_id, work_dir);

    // Print the interesting events while the fleet runs.
    let printer = tokio::spawn(async move {
        loop {
            let ev = events.recv().await;
            match ev.kind {
                EventKind::AgentOutput => {
                    if let Some(text) = ev.payload["text"].as_str() {
                        println!("{text}");
                    }
                }
                EventKind::ToolCalled => {
                    println!("→ tool {}", ev.payload["tool"].as_str().unwrap_or("?"));
                }
                EventKind::TaskStatusChanged => {
                    println!(
                        "· task {} {} -> {}",
                        ev.task_id.as_deref().unwrap_or("?"),
                        ev.payload["from"].as_str().unwrap_or("?"),
                        ev.payload["to"].as_str().unwrap_or("?")
                    );
                }
                EventKind::ModelDegraded => {
                    eprintln!(
                        "! model degraded: {} -> {}",
                        ev.payload["from"].as_str().unwrap_or("?"),
                        ev.payload["to"].as_str().unwrap_or("?")
                    );
                }
                EventKind::Error => {
                    eprintln!("! error: {}", ev.payload);
                }
                _ => {}
            }
        }
    });

    let result = orchestrator.run_root_task(task, agent).await?;
    printer.abort();

    if result.success {
        println!("\n{}", result.output);
        Ok(())
    } else {
        anyhow::bail!(
            "task failed: {}",
            result.error.unwrap_or_else(|| "unknown error".into())
        )
    }
}

fn load_agents(path: &PathBuf) -> anyhow::Result<AgentRegistry> {
    if path.is_dir() {
        AgentRegistry::load_dir(path)
    } else {
        AgentRegistry::load_file(path)
    }
    .with_context(|| format!("loading agent definitions from {}", path.display()))
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
