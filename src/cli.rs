// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Local-first orchestration kernel for fleets of specialized LLM agents.
#[derive(Parser, Debug)]
#[command(name = "sindri", version, about)]
pub struct Cli {
    /// Explicit config file (merged over the discovered layers).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr (RUST_LOG controls the filter; default `info`).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a root task to completion and print its result.
    Run {
        /// The task description handed to the root agent.
        task: String,

        /// Agent to assign the root task to.
        #[arg(long, short = 'a')]
        agent: String,

        /// Agent definitions: a YAML file with an `agents:` map, or a
        /// directory of one-agent YAML files.
        #[arg(long, default_value = ".sindri/agents.yaml")]
        agents: PathBuf,

        /// SQLite store path.  Ephemeral runs (checkpointing disabled in
        /// config) use an in-memory store instead.
        #[arg(long, default_value = ".sindri/sindri.db")]
        store: PathBuf,

        /// Working directory tools operate in (default: current dir).
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// Index the working directory into semantic memory before running.
        #[arg(long)]
        index: bool,
    },

    /// Print the effective merged configuration and exit.
    ShowConfig,

    /// Run integrity checks against a store and exit non-zero on damage.
    CheckStore {
        #[arg(default_value = ".sindri/sindri.db")]
        store: PathBuf,
    },

    /// List crash-recovery checkpoints in a store.
    Checkpoints {
        #[arg(default_value = ".sindri/sindri.db")]
        store: PathBuf,
    },
}
