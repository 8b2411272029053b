// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Non-progress detection for the agent loop.
//!
//! Three triggers:
//! 1. repetition — consecutive responses whose word overlap exceeds the
//!    similarity threshold while no tools executed;
//! 2. tool thrash — the same tool with the same arguments invoked three or
//!    more times in one session;
//! 3. clarification loop — three tool-free assistant turns in a row ending
//!    in an unanswered question.
//!
//! Each trigger earns the agent a nudge; `max_nudges` consecutive nudges
//! without intervening progress escalate to a stuck failure.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

const REPEATED_CALL_LIMIT: u32 = 3;
const QUESTION_RUN_LIMIT: usize = 3;

pub struct StuckDetector {
    similarity_threshold: f64,
    max_nudges: u32,
    previous_response: Option<String>,
    /// Whether each of the last tool-free turns ended in a question.
    question_run: usize,
    call_counts: HashMap<String, u32>,
    consecutive_nudges: u32,
    pending_trigger: Option<&'static str>,
}

impl StuckDetector {
    pub fn new(similarity_threshold: f64, max_nudges: u32) -> Self {
        Self {
            similarity_threshold,
            max_nudges,
            previous_response: None,
            question_run: 0,
            call_counts: HashMap::new(),
            consecutive_nudges: 0,
            pending_trigger: None,
        }
    }

    /// Record a tool invocation.  Arms the thrash trigger when the same
    /// call keeps coming back.
    pub fn observe_tool_call(&mut self, name: &str, args: &Value) {
        let key = format!("{name}:{args}");
        let count = self.call_counts.entry(key).or_insert(0);
        *count += 1;
        if *count >= REPEATED_CALL_LIMIT {
            self.pending_trigger = Some("repeated_tool_call");
        }
    }

    /// Record the assistant response for this iteration and whether any
    /// tool executed.  Returns the trigger name when the agent looks stuck.
    pub fn observe_response(&mut self, text: &str, tools_executed: bool) -> Option<&'static str> {
        if tools_executed {
            // Real work happened; repetition and question tracking restart.
            self.previous_response = Some(text.to_string());
            self.question_run = 0;
            return self.pending_trigger.take();
        }

        let mut trigger = self.pending_trigger.take();

        if let Some(prev) = &self.previous_response {
            if word_overlap(prev, text) >= self.similarity_threshold {
                trigger = Some("repetitive_response");
            }
        }

        if text.trim_end().ends_with('?') {
            self.question_run += 1;
            if self.question_run >= QUESTION_RUN_LIMIT {
                trigger = Some("clarification_loop");
            }
        } else {
            self.question_run = 0;
        }

        self.previous_response = Some(text.to_string());
        trigger
    }

    /// A successful tool execution counts as progress and resets the
    /// escalation counter.
    pub fn note_progress(&mut self) {
        self.consecutive_nudges = 0;
    }

    /// Whether the nudge budget is already spent; when false, the caller
    /// should inject a nudge and continue.
    pub fn nudges_exhausted(&self) -> bool {
        self.consecutive_nudges >= self.max_nudges
    }

    pub fn note_nudge(&mut self) {
        self.consecutive_nudges += 1;
    }

    pub fn nudge_count(&self) -> u32 {
        self.consecutive_nudges
    }
}

/// Jaccard overlap of lowercased word sets.
fn word_overlap(a: &str, b: &str) -> f64 {
    let words = |s: &str| -> HashSet<String> {
        s.split_whitespace()
            .map(|w| w.to_lowercase())
            .collect()
    };
    let wa = words(a);
    let wb = words(b);
    if wa.is_empty() && wb.is_empty() {
        return 1.0;
    }
    let intersection = wa.intersection(&wb).count();
    let union = wa.union(&wb).count();
    intersection as f64 / union as f64
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
