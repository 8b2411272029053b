// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! SQLite-backed persistence for sessions, checkpoints, and memory tables.
//!
//! One connection behind a mutex: turn appends for a session are serialized,
//! and the `(session_id, seq)` primary key makes any attempt to rewrite an
//! existing turn a constraint error instead of silent corruption.
//!
//! Schema changes are versioned via `PRAGMA user_version`.  Before applying
//! migrations to an existing store, the database file is copied to
//! `<path>.bak.<version>` so a failed migration can be rolled back by hand.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info, warn};
use uuid::Uuid;

use sindri_model::{Role, Turn};

use crate::records::{
    CheckpointRecord, ChunkRecord, EpisodeRecord, PatternRecord, SessionRecord, SessionStatus,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("no such session: {0}")]
    NoSuchSession(String),
    #[error("corrupt store: {0}")]
    Corrupt(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ordered schema migrations; index = `user_version` after applying.
const MIGRATIONS: &[&str] = &[r#"
CREATE TABLE sessions (
    id               TEXT PRIMARY KEY,
    task_description TEXT NOT NULL,
    model            TEXT NOT NULL,
    status           TEXT NOT NULL,
    iteration_count  INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);

CREATE TABLE turns (
    session_id      TEXT NOT NULL REFERENCES sessions(id),
    seq             INTEGER NOT NULL,
    role            TEXT NOT NULL,
    content         TEXT NOT NULL,
    tool_calls_json TEXT,
    timestamp       TEXT NOT NULL,
    PRIMARY KEY (session_id, seq)
);

CREATE TABLE checkpoints (
    task_id    TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    iteration  INTEGER NOT NULL,
    status     TEXT NOT NULL,
    payload    TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE episodes (
    id            TEXT PRIMARY KEY,
    project_id    TEXT NOT NULL,
    event_type    TEXT NOT NULL,
    content       TEXT NOT NULL,
    metadata      TEXT NOT NULL,
    embedding_ref TEXT,
    timestamp     TEXT NOT NULL
);
CREATE INDEX idx_episodes_project ON episodes(project_id, timestamp);

CREATE TABLE chunks (
    id            TEXT PRIMARY KEY,
    namespace     TEXT NOT NULL,
    path          TEXT NOT NULL,
    line_range    TEXT NOT NULL,
    text          TEXT NOT NULL,
    embedding_ref TEXT,
    content_hash  TEXT NOT NULL
);
CREATE INDEX idx_chunks_namespace ON chunks(namespace, path);

CREATE TABLE patterns (
    id                 TEXT PRIMARY KEY,
    context_tag        TEXT NOT NULL,
    keywords_json      TEXT NOT NULL,
    tool_sequence_json TEXT NOT NULL,
    success_rate       REAL NOT NULL,
    usage_count        INTEGER NOT NULL
);
"#];

pub struct SessionStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SessionStore {
    /// Open (creating if needed) the store at `path` and bring the schema up
    /// to date.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        store.apply_migrations()?;
        Ok(store)
    }

    /// Ephemeral in-memory store for tests and checkpoint-disabled runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        store.apply_migrations()?;
        Ok(store)
    }

    fn apply_migrations(&self) -> Result<(), StoreError> {
        let conn = self.lock();
        let version: usize =
            conn.query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))? as usize;
        if version >= MIGRATIONS.len() {
            return Ok(());
        }
        // Back up the on-disk file before changing an existing schema.
        if version > 0 {
            if let Some(path) = &self.path {
                let backup = PathBuf::from(format!("{}.bak.{version}", path.display()));
                info!(from = %path.display(), to = %backup.display(), "backing up store before migration");
                std::fs::copy(path, &backup)?;
            }
        }
        for (i, migration) in MIGRATIONS.iter().enumerate().skip(version) {
            debug!(version = i + 1, "applying store migration");
            conn.execute_batch(migration)?;
            conn.pragma_update(None, "user_version", (i + 1) as i64)?;
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-statement; propagating the
        // panic is the only sound option for a storage layer.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Sessions & turns ─────────────────────────────────────────────────────

    /// Create a new session and return its record (no turns yet).
    pub fn create_session(
        &self,
        task_description: &str,
        model: &str,
    ) -> Result<SessionRecord, StoreError> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        self.lock().execute(
            "INSERT INTO sessions (id, task_description, model, status, iteration_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
            params![id, task_description, model, SessionStatus::Active.as_str(), now.to_rfc3339()],
        )?;
        Ok(SessionRecord {
            id,
            task_description: task_description.to_string(),
            model: model.to_string(),
            status: SessionStatus::Active,
            iteration_count: 0,
            created_at: now,
            updated_at: now,
            turns: Vec::new(),
        })
    }

    /// Load a session with its full turn log, turns in `seq` order.
    pub fn load_session(&self, id: &str) -> Result<SessionRecord, StoreError> {
        let conn = self.lock();
        let mut record = conn
            .query_row(
                "SELECT id, task_description, model, status, iteration_count, created_at, updated_at
                 FROM sessions WHERE id = ?1",
                params![id],
                |row| {
                    Ok(SessionRecord {
                        id: row.get(0)?,
                        task_description: row.get(1)?,
                        model: row.get(2)?,
                        status: SessionStatus::parse(&row.get::<_, String>(3)?)
                            .unwrap_or(SessionStatus::Active),
                        iteration_count: row.get(4)?,
                        created_at: parse_ts(&row.get::<_, String>(5)?),
                        updated_at: parse_ts(&row.get::<_, String>(6)?),
                        turns: Vec::new(),
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NoSuchSession(id.to_string()))?;

        let mut stmt = conn.prepare(
            "SELECT role, content, tool_calls_json, timestamp
             FROM turns WHERE session_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            let role: String = row.get(0)?;
            let content: String = row.get(1)?;
            let tool_calls_json: Option<String> = row.get(2)?;
            let timestamp: String = row.get(3)?;
            Ok((role, content, tool_calls_json, timestamp))
        })?;
        for row in rows {
            let (role, content, tool_calls_json, timestamp) = row?;
            let tool_calls = match tool_calls_json {
                Some(json) => serde_json::from_str(&json)
                    .map_err(|e| StoreError::Corrupt(format!("turn tool_calls_json: {e}")))?,
                None => None,
            };
            record.turns.push(Turn {
                role: parse_role(&role)?,
                content,
                tool_calls,
                timestamp: parse_ts(&timestamp),
            });
        }
        Ok(record)
    }

    /// Append one turn; returns the assigned `seq`.  Sequence numbers are
    /// dense and strictly increasing per session, assigned inside a
    /// transaction so concurrent appends cannot collide.
    pub fn append_turn(&self, session_id: &str, turn: &Turn) -> Result<u64, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let exists: Option<String> = tx
            .query_row(
                "SELECT id FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NoSuchSession(session_id.to_string()));
        }
        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM turns WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        let tool_calls_json = turn
            .tool_calls
            .as_ref()
            .map(|calls| serde_json::to_string(calls))
            .transpose()
            .map_err(|e| StoreError::Corrupt(format!("serializing tool calls: {e}")))?;
        tx.execute(
            "INSERT INTO turns (session_id, seq, role, content, tool_calls_json, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                session_id,
                seq,
                role_str(turn.role),
                turn.content,
                tool_calls_json,
                turn.timestamp.to_rfc3339()
            ],
        )?;
        tx.execute(
            "UPDATE sessions SET updated_at = ?2 WHERE id = ?1",
            params![session_id, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(seq as u64)
    }

    pub fn set_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE sessions SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![session_id, status.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_iteration_count(&self, session_id: &str, count: u32) -> Result<(), StoreError> {
        self.lock().execute(
            "UPDATE sessions SET iteration_count = ?2, updated_at = ?3 WHERE id = ?1",
            params![session_id, count, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // ── Checkpoints ──────────────────────────────────────────────────────────

    pub fn save_checkpoint(&self, cp: &CheckpointRecord) -> Result<(), StoreError> {
        let payload = cp
            .error_context
            .as_ref()
            .map(|e| serde_json::json!({ "error_context": e }).to_string());
        self.lock().execute(
            "INSERT INTO checkpoints (task_id, session_id, iteration, status, payload, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(task_id) DO UPDATE SET
                 session_id = excluded.session_id,
                 iteration  = excluded.iteration,
                 status     = excluded.status,
                 payload    = excluded.payload,
                 updated_at = excluded.updated_at",
            params![
                cp.task_id,
                cp.session_id,
                cp.iteration,
                cp.status,
                payload,
                cp.updated_at.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn load_checkpoint(&self, task_id: &str) -> Result<Option<CheckpointRecord>, StoreError> {
        let record = self
            .lock()
            .query_row(
                "SELECT task_id, session_id, iteration, status, payload, updated_at
                 FROM checkpoints WHERE task_id = ?1",
                params![task_id],
                |row| {
                    let payload: Option<String> = row.get(4)?;
                    Ok(CheckpointRecord {
                        task_id: row.get(0)?,
                        session_id: row.get(1)?,
                        iteration: row.get(2)?,
                        status: row.get(3)?,
                        error_context: payload.and_then(|p| {
                            serde_json::from_str::<serde_json::Value>(&p)
                                .ok()?
                                .get("error_context")?
                                .as_str()
                                .map(String::from)
                        }),
                        updated_at: parse_ts(&row.get::<_, String>(5)?),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    pub fn clear_checkpoint(&self, task_id: &str) -> Result<(), StoreError> {
        self.lock()
            .execute("DELETE FROM checkpoints WHERE task_id = ?1", params![task_id])?;
        Ok(())
    }

    /// Checkpoints that survived a crash and may be resumed.
    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT task_id, session_id, iteration, status, payload, updated_at
             FROM checkpoints ORDER BY updated_at",
        )?;
        let rows = stmt.query_map([], |row| {
            let payload: Option<String> = row.get(4)?;
            Ok(CheckpointRecord {
                task_id: row.get(0)?,
                session_id: row.get(1)?,
                iteration: row.get(2)?,
                status: row.get(3)?,
                error_context: payload.and_then(|p| {
                    serde_json::from_str::<serde_json::Value>(&p)
                        .ok()?
                        .get("error_context")?
                        .as_str()
                        .map(String::from)
                }),
                updated_at: parse_ts(&row.get::<_, String>(5)?),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ── Episodes ─────────────────────────────────────────────────────────────

    pub fn insert_episode(&self, ep: &EpisodeRecord) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO episodes (id, project_id, event_type, content, metadata, embedding_ref, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                ep.id,
                ep.project_id,
                ep.event_type,
                ep.content,
                ep.metadata.to_string(),
                ep.embedding_ref,
                ep.timestamp.to_rfc3339()
            ],
        )?;
        Ok(())
    }

    /// Most recent episodes for a project, newest first.
    pub fn episodes_for_project(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<EpisodeRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, event_type, content, metadata, embedding_ref, timestamp
             FROM episodes WHERE project_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![project_id, limit as i64], |row| {
            let metadata: String = row.get(4)?;
            Ok(EpisodeRecord {
                id: row.get(0)?,
                project_id: row.get(1)?,
                event_type: row.get(2)?,
                content: row.get(3)?,
                metadata: serde_json::from_str(&metadata)
                    .unwrap_or(serde_json::Value::Null),
                embedding_ref: row.get(5)?,
                timestamp: parse_ts(&row.get::<_, String>(6)?),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ── Chunks ───────────────────────────────────────────────────────────────

    pub fn upsert_chunk(&self, chunk: &ChunkRecord) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO chunks (id, namespace, path, line_range, text, embedding_ref, content_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 text = excluded.text,
                 embedding_ref = excluded.embedding_ref,
                 content_hash = excluded.content_hash",
            params![
                chunk.id,
                chunk.namespace,
                chunk.path,
                chunk.line_range,
                chunk.text,
                chunk.embedding_ref,
                chunk.content_hash
            ],
        )?;
        Ok(())
    }

    pub fn delete_chunks_for_path(&self, namespace: &str, path: &str) -> Result<(), StoreError> {
        self.lock().execute(
            "DELETE FROM chunks WHERE namespace = ?1 AND path = ?2",
            params![namespace, path],
        )?;
        Ok(())
    }

    /// Map of `path → set of content hashes` currently indexed in a
    /// namespace; the indexer uses it to skip unchanged files.
    pub fn chunk_hashes(&self, namespace: &str) -> Result<HashMap<String, String>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT DISTINCT path, content_hash FROM chunks WHERE namespace = ?1")?;
        let rows = stmt.query_map(params![namespace], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (path, hash) = row?;
            out.insert(path, hash);
        }
        Ok(out)
    }

    pub fn chunk_ids(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id FROM chunks WHERE namespace = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![namespace], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_chunk(&self, id: &str) -> Result<Option<ChunkRecord>, StoreError> {
        let record = self
            .lock()
            .query_row(
                "SELECT id, namespace, path, line_range, text, embedding_ref, content_hash
                 FROM chunks WHERE id = ?1",
                params![id],
                |row| {
                    Ok(ChunkRecord {
                        id: row.get(0)?,
                        namespace: row.get(1)?,
                        path: row.get(2)?,
                        line_range: row.get(3)?,
                        text: row.get(4)?,
                        embedding_ref: row.get(5)?,
                        content_hash: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    // ── Patterns ─────────────────────────────────────────────────────────────

    pub fn upsert_pattern(&self, p: &PatternRecord) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO patterns (id, context_tag, keywords_json, tool_sequence_json, success_rate, usage_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 keywords_json = excluded.keywords_json,
                 tool_sequence_json = excluded.tool_sequence_json,
                 success_rate = excluded.success_rate,
                 usage_count = excluded.usage_count",
            params![
                p.id,
                p.context_tag,
                serde_json::to_string(&p.keywords).unwrap_or_else(|_| "[]".into()),
                serde_json::to_string(&p.tool_sequence).unwrap_or_else(|_| "[]".into()),
                p.success_rate,
                p.usage_count as i64
            ],
        )?;
        Ok(())
    }

    pub fn patterns(&self) -> Result<Vec<PatternRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, context_tag, keywords_json, tool_sequence_json, success_rate, usage_count
             FROM patterns ORDER BY usage_count DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            let keywords_json: String = row.get(2)?;
            let sequence_json: String = row.get(3)?;
            Ok(PatternRecord {
                id: row.get(0)?,
                context_tag: row.get(1)?,
                keywords: serde_json::from_str(&keywords_json).unwrap_or_default(),
                tool_sequence: serde_json::from_str(&sequence_json).unwrap_or_default(),
                success_rate: row.get(4)?,
                usage_count: row.get::<_, i64>(5)? as u64,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ── Integrity ────────────────────────────────────────────────────────────

    /// Startup health check: SQLite's own integrity scan plus a seq-gap
    /// scan over every session's turn log.
    pub fn integrity_check(&self) -> Result<(), StoreError> {
        let conn = self.lock();
        let verdict: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if verdict != "ok" {
            return Err(StoreError::Corrupt(format!("sqlite reports: {verdict}")));
        }
        let mut stmt =
            conn.prepare("SELECT session_id, seq FROM turns ORDER BY session_id, seq")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut last: Option<(String, i64)> = None;
        for row in rows {
            let (session, seq) = row?;
            let expected = match &last {
                Some((prev_session, prev_seq)) if *prev_session == session => prev_seq + 1,
                _ => 1,
            };
            if seq != expected {
                warn!(session = %session, seq, expected, "turn sequence gap");
                return Err(StoreError::Corrupt(format!(
                    "session {session}: expected seq {expected}, found {seq}"
                )));
            }
            last = Some((session, seq));
        }
        Ok(())
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn parse_role(s: &str) -> Result<Role, StoreError> {
    match s {
        "system" => Ok(Role::System),
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        "tool" => Ok(Role::Tool),
        other => Err(StoreError::Corrupt(format!("unknown turn role: {other}"))),
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
