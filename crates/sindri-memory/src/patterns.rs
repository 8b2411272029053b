// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Learned tool-sequence patterns.
//!
//! After a task finishes, the orchestrator records which tools the agent
//! used and whether the task succeeded.  Later tasks with a similar
//! description get the best-scoring sequence suggested in their context, so
//! the fleet gradually converges on working approaches.

use std::sync::Arc;

use sindri_store::{PatternRecord, SessionStore};
use tracing::debug;

pub struct PatternStore {
    store: Arc<SessionStore>,
}

impl PatternStore {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    /// Record one observed tool sequence for a context tag.  An existing
    /// pattern for the same `(context_tag, tool_sequence)` is reinforced:
    /// its success rate becomes the running average over all observations.
    pub fn learn(
        &self,
        context_tag: &str,
        keywords: &[String],
        tool_sequence: &[String],
        success: bool,
    ) -> anyhow::Result<Option<PatternRecord>> {
        if tool_sequence.is_empty() {
            return Ok(None);
        }
        let id = format!("{context_tag}:{}", tool_sequence.join(">"));
        let existing = self
            .store
            .patterns()?
            .into_iter()
            .find(|p| p.id == id);
        let record = match existing {
            Some(mut p) => {
                let observations = p.usage_count as f64;
                p.success_rate = (p.success_rate * observations + if success { 1.0 } else { 0.0 })
                    / (observations + 1.0);
                p.usage_count += 1;
                for kw in keywords {
                    if !p.keywords.contains(kw) {
                        p.keywords.push(kw.clone());
                    }
                }
                p
            }
            None => PatternRecord {
                id,
                context_tag: context_tag.to_string(),
                keywords: keywords.to_vec(),
                tool_sequence: tool_sequence.to_vec(),
                success_rate: if success { 1.0 } else { 0.0 },
                usage_count: 1,
            },
        };
        self.store.upsert_pattern(&record)?;
        debug!(pattern = %record.id, rate = record.success_rate, "pattern learned");
        Ok(Some(record))
    }

    /// Best pattern for a task description, scored by keyword overlap and
    /// weighted by success rate.  Returns `None` when nothing matches.
    pub fn suggest(&self, description: &str) -> anyhow::Result<Option<PatternRecord>> {
        let words: Vec<String> = description
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|w| w.len() > 2)
            .map(|w| w.to_lowercase())
            .collect();
        let mut best: Option<(f64, PatternRecord)> = None;
        for p in self.store.patterns()? {
            let overlap = p
                .keywords
                .iter()
                .filter(|k| words.contains(&k.to_lowercase()))
                .count();
            if overlap == 0 {
                continue;
            }
            let score = overlap as f64 * p.success_rate;
            if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                best = Some((score, p));
            }
        }
        Ok(best.map(|(_, p)| p))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns() -> PatternStore {
        PatternStore::new(Arc::new(SessionStore::open_in_memory().unwrap()))
    }

    fn kw(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn learn_creates_then_reinforces() {
        let ps = patterns();
        let seq = kw(&["read_file", "write_file"]);
        let first = ps
            .learn("file_edit", &kw(&["write", "file"]), &seq, true)
            .unwrap()
            .unwrap();
        assert_eq!(first.usage_count, 1);
        assert_eq!(first.success_rate, 1.0);

        let second = ps
            .learn("file_edit", &kw(&["write"]), &seq, false)
            .unwrap()
            .unwrap();
        assert_eq!(second.usage_count, 2);
        assert_eq!(second.success_rate, 0.5);
    }

    #[test]
    fn empty_sequence_learns_nothing() {
        let ps = patterns();
        assert!(ps.learn("t", &kw(&["x"]), &[], true).unwrap().is_none());
    }

    #[test]
    fn suggest_matches_by_keyword() {
        let ps = patterns();
        ps.learn(
            "file_edit",
            &kw(&["write", "file"]),
            &kw(&["write_file"]),
            true,
        )
        .unwrap();
        ps.learn("web", &kw(&["fetch", "url"]), &kw(&["http_fetch"]), true)
            .unwrap();

        let hit = ps.suggest("please write the config file").unwrap().unwrap();
        assert_eq!(hit.tool_sequence, vec!["write_file"]);
        assert!(ps.suggest("completely unrelated gardening").unwrap().is_none());
    }

    #[test]
    fn suggest_prefers_higher_success_rate() {
        let ps = patterns();
        ps.learn("a", &kw(&["deploy"]), &kw(&["shell"]), false).unwrap();
        ps.learn("b", &kw(&["deploy"]), &kw(&["read_file", "shell"]), true)
            .unwrap();
        let hit = ps.suggest("deploy the service").unwrap().unwrap();
        assert_eq!(hit.tool_sequence, vec!["read_file", "shell"]);
    }
}
