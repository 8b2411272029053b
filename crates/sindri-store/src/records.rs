// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sindri_model::Turn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Complete,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// A session with its full ordered turn log.
///
/// Turns are append-only; `turns[i]` was stored with `seq = i + 1` and the
/// store rejects any attempt to rewrite history.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub task_description: String,
    pub model: String,
    pub status: SessionStatus,
    pub iteration_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turns: Vec<Turn>,
}

/// Durable recovery point for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub task_id: String,
    pub session_id: String,
    pub iteration: u32,
    pub status: String,
    pub error_context: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// One episodic-memory entry: something that happened in a project.
#[derive(Debug, Clone)]
pub struct EpisodeRecord {
    pub id: String,
    pub project_id: String,
    pub event_type: String,
    pub content: String,
    pub metadata: serde_json::Value,
    /// Id of the vector stored in the vector index, when embedded.
    pub embedding_ref: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One semantic-memory chunk: a slice of a project file.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    /// Derived from `(path, line_range, content_hash)`; stable across
    /// re-indexing runs when the content has not changed.
    pub id: String,
    pub namespace: String,
    pub path: String,
    pub line_range: String,
    pub text: String,
    pub embedding_ref: Option<String>,
    pub content_hash: String,
}

/// A learned tool-sequence pattern.
#[derive(Debug, Clone)]
pub struct PatternRecord {
    pub id: String,
    pub context_tag: String,
    pub keywords: Vec<String>,
    pub tool_sequence: Vec<String>,
    pub success_rate: f64,
    pub usage_count: u64,
}
