// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Five-tier context assembly.
//!
//! The budget is split across tiers by percentage share (working 50,
//! episodic 18, semantic 18, pattern 5, analysis 9 by default).  Each tier
//! truncates to its own slice; a tier that comes up short leaves its budget
//! unused rather than spilling it into another tier, so the mix of recency
//! and recall stays predictable.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use sindri_config::MemoryTierShares;
use sindri_model::Turn;
use sindri_store::{EpisodeRecord, SessionStore};

use crate::{Embedder, PatternStore, VectorIndex};

/// Event type under which project architecture/style summaries are stored.
const ANALYSIS_EVENT: &str = "project_analysis";

const EPISODIC_K: usize = 5;
const SEMANTIC_K: usize = 8;

/// Counting seam so deployments can plug a real tokenizer in; the default
/// is the 4-chars-per-token heuristic used across the kernel.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

struct CharTokenCounter;

impl TokenCounter for CharTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.len() / 4
    }
}

pub struct ContextBuilder {
    store: Arc<SessionStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    patterns: PatternStore,
    shares: MemoryTierShares,
    counter: Box<dyn TokenCounter>,
}

impl ContextBuilder {
    pub fn new(
        store: Arc<SessionStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        shares: MemoryTierShares,
    ) -> Self {
        Self {
            patterns: PatternStore::new(store.clone()),
            store,
            index,
            embedder,
            shares,
            counter: Box::new(CharTokenCounter),
        }
    }

    pub fn with_token_counter(mut self, counter: Box<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    fn episodes_namespace(project_id: &str) -> String {
        format!("{project_id}#episodes")
    }

    /// Record an episode: persisted in the store and embedded into the
    /// vector index for similarity recall.
    pub async fn record_episode(
        &self,
        project_id: &str,
        event_type: &str,
        content: &str,
        metadata: serde_json::Value,
    ) -> anyhow::Result<()> {
        let id = Uuid::new_v4().to_string();
        let vector = self.embedder.embed(content).await?;
        self.index
            .upsert(
                &Self::episodes_namespace(project_id),
                &id,
                vector,
                json!({ "event_type": event_type, "content": content }),
            )
            .await?;
        self.store.insert_episode(&EpisodeRecord {
            id: id.clone(),
            project_id: project_id.to_string(),
            event_type: event_type.to_string(),
            content: content.to_string(),
            metadata,
            embedding_ref: Some(id),
            timestamp: Utc::now(),
        })?;
        Ok(())
    }

    /// Store (or refresh) the project architecture/style summary consumed
    /// by the analysis tier.
    pub async fn record_analysis(&self, project_id: &str, summary: &str) -> anyhow::Result<()> {
        self.record_episode(project_id, ANALYSIS_EVENT, summary, json!({}))
            .await
    }

    pub fn pattern_store(&self) -> &PatternStore {
        &self.patterns
    }

    /// Assemble the ordered message list for one LLM call.
    ///
    /// Recall tiers come first as system turns, then the working tier —
    /// the most recent conversation turns verbatim, oldest first.
    pub async fn build(
        &self,
        project_id: &str,
        task_description: &str,
        recent: &[Turn],
        max_tokens: usize,
    ) -> anyhow::Result<Vec<Turn>> {
        let budget = |share: u8| max_tokens * share as usize / 100;
        let mut out = Vec::new();

        let query = self.embedder.embed(task_description).await?;

        if let Some(text) = self
            .analysis_tier(project_id, budget(self.shares.analysis))
            .await?
        {
            out.push(Turn::system(text));
        }
        if let Some(text) = self
            .episodic_tier(project_id, &query, budget(self.shares.episodic))
            .await?
        {
            out.push(Turn::system(text));
        }
        if let Some(text) = self
            .semantic_tier(project_id, &query, budget(self.shares.semantic))
            .await?
        {
            out.push(Turn::system(text));
        }
        if let Some(text) = self.pattern_tier(task_description, budget(self.shares.pattern))? {
            out.push(Turn::system(text));
        }

        out.extend(self.working_tier(recent, budget(self.shares.working)));
        debug!(
            turns = out.len(),
            max_tokens, "context assembled"
        );
        Ok(out)
    }

    /// Most recent turns verbatim: walk backwards until the budget is
    /// spent, then restore chronological order.
    fn working_tier(&self, recent: &[Turn], budget: usize) -> Vec<Turn> {
        let mut picked = Vec::new();
        let mut spent = 0usize;
        for turn in recent.iter().rev() {
            let cost = self.counter.count(&turn.content).max(1);
            // The newest turn is always kept; without it the model has no
            // idea what it was just doing.
            if !picked.is_empty() && spent + cost > budget {
                break;
            }
            spent += cost;
            picked.push(turn.clone());
        }
        picked.reverse();
        picked
    }

    async fn episodic_tier(
        &self,
        project_id: &str,
        query: &[f32],
        budget: usize,
    ) -> anyhow::Result<Option<String>> {
        let hits = self
            .index
            .search(&Self::episodes_namespace(project_id), query, EPISODIC_K)
            .await?;
        let mut items: Vec<String> = hits
            .iter()
            .filter(|h| h.payload["event_type"] != ANALYSIS_EVENT)
            .filter_map(|h| h.payload["content"].as_str().map(String::from))
            .collect();
        if items.is_empty() {
            // Fresh process: the in-memory index has nothing yet, but the
            // store may hold episodes from earlier runs.
            items = self
                .store
                .episodes_for_project(project_id, EPISODIC_K)?
                .into_iter()
                .filter(|e| e.event_type != ANALYSIS_EVENT)
                .map(|e| e.content)
                .collect();
        }
        Ok(self.bulleted_section("Past task outcomes in this project:", &items, budget))
    }

    async fn semantic_tier(
        &self,
        project_id: &str,
        query: &[f32],
        budget: usize,
    ) -> anyhow::Result<Option<String>> {
        let hits = self.index.search(project_id, query, SEMANTIC_K).await?;
        let mut seen = std::collections::HashSet::new();
        let mut items = Vec::new();
        for hit in hits {
            let path = hit.payload["path"].as_str().unwrap_or_default().to_string();
            let range = hit.payload["line_range"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            // Deduplicate by (path, line_range).
            if !seen.insert((path.clone(), range.clone())) {
                continue;
            }
            if let Some(text) = hit.payload["text"].as_str() {
                items.push(format!("{path}:{range}\n{text}"));
            }
        }
        Ok(self.bulleted_section("Relevant code from this project:", &items, budget))
    }

    fn pattern_tier(&self, description: &str, budget: usize) -> anyhow::Result<Option<String>> {
        let Some(p) = self.patterns.suggest(description)? else {
            return Ok(None);
        };
        let text = format!(
            "A similar task succeeded {:.0}% of the time (over {} runs) with the tool sequence: {}",
            p.success_rate * 100.0,
            p.usage_count,
            p.tool_sequence.join(" then ")
        );
        if self.counter.count(&text) > budget {
            return Ok(None);
        }
        Ok(Some(text))
    }

    async fn analysis_tier(
        &self,
        project_id: &str,
        budget: usize,
    ) -> anyhow::Result<Option<String>> {
        let latest = self
            .store
            .episodes_for_project(project_id, 50)?
            .into_iter()
            .find(|e| e.event_type == ANALYSIS_EVENT);
        let Some(ep) = latest else { return Ok(None) };
        let text = format!("Project overview:\n{}", ep.content);
        Ok(Some(self.truncate_to(&text, budget)))
    }

    /// Join items under a header, dropping whole items once the budget is
    /// spent.  Returns `None` when nothing fits.
    fn bulleted_section(&self, header: &str, items: &[String], budget: usize) -> Option<String> {
        if items.is_empty() {
            return None;
        }
        let mut text = String::from(header);
        let mut spent = self.counter.count(header);
        let mut added = 0usize;
        for item in items {
            let entry = format!("\n- {item}");
            let cost = self.counter.count(&entry);
            if spent + cost > budget {
                break;
            }
            spent += cost;
            text.push_str(&entry);
            added += 1;
        }
        (added > 0).then_some(text)
    }

    /// Cut at a line boundary so a truncated section stays readable.
    fn truncate_to(&self, text: &str, budget: usize) -> String {
        if self.counter.count(text) <= budget {
            return text.to_string();
        }
        let mut out = String::new();
        for line in text.lines() {
            let candidate = if out.is_empty() {
                line.to_string()
            } else {
                format!("{out}\n{line}")
            };
            if self.counter.count(&candidate) > budget {
                break;
            }
            out = candidate;
        }
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HashingEmbedder, InMemoryIndex, ProjectIndexer};
    use sindri_model::Role;

    fn builder() -> (ContextBuilder, Arc<SessionStore>, Arc<InMemoryIndex>) {
        let store = Arc::new(SessionStore::open_in_memory().unwrap());
        let index = Arc::new(InMemoryIndex::new());
        let b = ContextBuilder::new(
            store.clone(),
            index.clone(),
            Arc::new(HashingEmbedder::default()),
            MemoryTierShares::default(),
        );
        (b, store, index)
    }

    #[tokio::test]
    async fn working_tier_keeps_recent_turns_in_order() {
        let (b, _, _) = builder();
        let recent = vec![
            Turn::user("first message"),
            Turn::assistant("second message"),
            Turn::user("third message"),
        ];
        let msgs = b.build("proj", "do things", &recent, 8_000).await.unwrap();
        let contents: Vec<&str> = msgs.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(
            contents,
            vec!["first message", "second message", "third message"]
        );
    }

    #[tokio::test]
    async fn working_tier_drops_oldest_when_over_budget() {
        let (b, _, _) = builder();
        let recent: Vec<Turn> = (0..20)
            .map(|i| Turn::user(format!("message number {i} with some padding text")))
            .collect();
        // Tiny budget: working share = 50% of 40 tokens = 20 tokens.
        let msgs = b.build("proj", "t", &recent, 40).await.unwrap();
        assert!(!msgs.is_empty());
        assert!(msgs.len() < 20, "must have dropped old turns");
        // The newest turn always survives.
        assert!(msgs.last().unwrap().content.contains("number 19"));
    }

    #[tokio::test]
    async fn semantic_tier_surfaces_indexed_code() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("manager.rs"),
            "fn evict_model() { /* vram eviction */ }\n",
        )
        .unwrap();
        let (b, store, index) = builder();
        let idxr = ProjectIndexer::new(
            store,
            index,
            Arc::new(HashingEmbedder::default()),
        );
        idxr.index_project("proj", dir.path()).await.unwrap();

        let msgs = b
            .build("proj", "fix vram eviction in manager", &[], 8_000)
            .await
            .unwrap();
        let semantic = msgs
            .iter()
            .find(|t| t.content.contains("Relevant code"))
            .expect("semantic tier present");
        assert!(semantic.content.contains("manager.rs:1-1"));
        assert_eq!(semantic.role, Role::System);
    }

    #[tokio::test]
    async fn episodic_tier_recalls_recorded_episodes() {
        let (b, _, _) = builder();
        b.record_episode(
            "proj",
            "task_completed",
            "Implemented the scheduler batch selection",
            json!({}),
        )
        .await
        .unwrap();
        let msgs = b
            .build("proj", "extend scheduler batch selection", &[], 8_000)
            .await
            .unwrap();
        assert!(msgs
            .iter()
            .any(|t| t.content.contains("Past task outcomes")
                && t.content.contains("scheduler batch selection")));
    }

    #[tokio::test]
    async fn analysis_tier_uses_latest_summary() {
        let (b, _, _) = builder();
        b.record_analysis("proj", "Rust workspace, tokio-based, six crates")
            .await
            .unwrap();
        let msgs = b.build("proj", "any task", &[], 8_000).await.unwrap();
        assert!(msgs
            .iter()
            .any(|t| t.content.contains("Project overview")
                && t.content.contains("six crates")));
        // The analysis episode must not leak into the episodic tier.
        assert!(!msgs.iter().any(|t| t.content.contains("Past task outcomes")));
    }

    #[tokio::test]
    async fn pattern_tier_suggests_learned_sequence() {
        let (b, _, _) = builder();
        b.pattern_store()
            .learn(
                "edit",
                &["config".to_string(), "update".to_string()],
                &["read_file".to_string(), "write_file".to_string()],
                true,
            )
            .unwrap();
        let msgs = b.build("proj", "update the config", &[], 8_000).await.unwrap();
        assert!(msgs
            .iter()
            .any(|t| t.content.contains("read_file then write_file")));
    }

    #[tokio::test]
    async fn empty_project_yields_only_working_turns() {
        let (b, _, _) = builder();
        let msgs = b
            .build("proj", "task", &[Turn::user("only turn")], 8_000)
            .await
            .unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "only turn");
    }
}
