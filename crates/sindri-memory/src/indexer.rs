// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Project indexing for semantic memory.
//!
//! Walks a project root, splits text files into ~50-line chunks, embeds
//! each chunk, and stores it under `namespace = project_id` in both the
//! chunk table and the vector index.  A file whose content hash is
//! unchanged since the last run is skipped entirely, which makes chunk ids
//! stable across re-indexing: the id is a digest of
//! `(path, line_range, content_hash)`.

use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info};
use walkdir::WalkDir;

use sindri_store::{ChunkRecord, SessionStore};

use crate::{Embedder, VectorIndex};

const CHUNK_LINES: usize = 50;
const MAX_FILE_BYTES: u64 = 512 * 1024;

/// Directory names never descended into.
const SKIP_DIRS: &[&str] = &[".git", "target", "node_modules", ".venv", "__pycache__"];

pub struct ProjectIndexer {
    store: Arc<SessionStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
}

impl ProjectIndexer {
    pub fn new(
        store: Arc<SessionStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
        }
    }

    /// Index (or re-index) a project root.  Returns the number of files
    /// whose chunks were (re)written.
    pub async fn index_project(&self, project_id: &str, root: &Path) -> anyhow::Result<usize> {
        let known_hashes = self.store.chunk_hashes(project_id)?;
        let mut changed_files = 0usize;

        for entry in WalkDir::new(root)
            .into_iter()
            // depth 0 is the root itself; only descendants are filtered.
            .filter_entry(|e| e.depth() == 0 || !is_skipped(e))
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
        {
            if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(entry.path()) else {
                continue; // not UTF-8 text
            };
            let rel = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            let content_hash = hex_digest(text.as_bytes());
            if known_hashes.get(&rel) == Some(&content_hash) {
                debug!(path = %rel, "unchanged; skipping");
                continue;
            }

            // Content changed (or new file): replace this path's chunks.
            self.store.delete_chunks_for_path(project_id, &rel)?;
            for (line_range, chunk_text) in chunk_lines(&text) {
                let id = chunk_id(&rel, &line_range, &content_hash);
                let vector = self.embedder.embed(&chunk_text).await?;
                self.index
                    .upsert(
                        project_id,
                        &id,
                        vector,
                        serde_json::json!({
                            "path": rel,
                            "line_range": line_range,
                            "text": chunk_text,
                        }),
                    )
                    .await?;
                self.store.upsert_chunk(&ChunkRecord {
                    id: id.clone(),
                    namespace: project_id.to_string(),
                    path: rel.clone(),
                    line_range,
                    text: chunk_text,
                    embedding_ref: Some(id),
                    content_hash: content_hash.clone(),
                })?;
            }
            changed_files += 1;
        }
        info!(project_id, changed_files, "project indexed");
        Ok(changed_files)
    }
}

fn is_skipped(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|n| SKIP_DIRS.contains(&n) || n.starts_with('.'))
            .unwrap_or(false)
}

/// Split into ~50-line segments; yields `("start-end", text)` with 1-based
/// inclusive line numbers.
fn chunk_lines(text: &str) -> Vec<(String, String)> {
    let lines: Vec<&str> = text.lines().collect();
    let mut chunks = Vec::new();
    for (i, window) in lines.chunks(CHUNK_LINES).enumerate() {
        let start = i * CHUNK_LINES + 1;
        let end = start + window.len() - 1;
        chunks.push((format!("{start}-{end}"), window.join("\n")));
    }
    chunks
}

fn chunk_id(path: &str, line_range: &str, content_hash: &str) -> String {
    hex_digest(format!("{path}:{line_range}:{content_hash}").as_bytes())[..16].to_string()
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
