// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Text-mode tool-call extraction.
//!
//! Models without a native tool-call protocol emit their calls as JSON in
//! the response text — fenced in a code block, inline in prose, and in a few
//! competing shapes.  This parser finds every top-level JSON object with a
//! string-aware brace scan (braces inside string values do not count),
//! applies two ordered repairs to near-valid JSON, and interprets the
//! accepted shapes:
//!
//! - `{"name": ..., "arguments": {...}}`
//! - `{"function": {"name": ..., "arguments": {...}}}`
//! - `{"tool": ..., "args": {...}}`
//!
//! Multiple calls in one response are returned in text order.

use serde_json::Value;

use sindri_model::ToolCallRecord;

struct Span<'a> {
    snippet: &'a str,
    closed: bool,
    in_string_at_end: bool,
}

/// Extract every tool call present in `text`, in order of appearance.
pub fn parse_tool_calls(text: &str) -> Vec<ToolCallRecord> {
    let mut calls = Vec::new();
    for span in extract_object_spans(text) {
        if let Some(value) = parse_candidate(&span) {
            if let Some(call) = interpret(&value, calls.len()) {
                calls.push(call);
            }
        }
    }
    calls
}

/// True when `text` contains something that was plausibly meant as a JSON
/// tool call.  Used to distinguish "no tools requested" from "tool request
/// we failed to parse" — the latter is surfaced as a parse-failure warning.
pub fn contains_json_like(text: &str) -> bool {
    extract_object_spans(text)
        .iter()
        .any(|s| s.snippet.contains('"') && s.snippet.contains(':'))
}

/// Scan for top-level `{...}` object spans.  Double quotes suspend brace
/// counting (escapes preserved), so braces inside string values are
/// tolerated.  A final unterminated span is returned with `closed = false`
/// so the repair stage can decide whether one closing brace may be added.
fn extract_object_spans(text: &str) -> Vec<Span<'_>> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            '}' => {
                if depth > 0 {
                    depth -= 1;
                    if depth == 0 {
                        spans.push(Span {
                            snippet: &text[start..i + 1],
                            closed: true,
                            in_string_at_end: false,
                        });
                    }
                }
            }
            _ => {}
        }
    }
    if depth > 0 {
        spans.push(Span {
            snippet: &text[start..],
            closed: false,
            in_string_at_end: in_string,
        });
    }
    spans
}

/// Parse a span, applying repairs in order: (1) strip trailing commas;
/// (2) close one missing brace, but only when the string state terminated.
fn parse_candidate(span: &Span<'_>) -> Option<Value> {
    if let Ok(v) = serde_json::from_str(span.snippet) {
        return Some(v);
    }
    let stripped = strip_trailing_commas(span.snippet);
    if let Ok(v) = serde_json::from_str(&stripped) {
        return Some(v);
    }
    if !span.closed && !span.in_string_at_end {
        let mut closed = String::from(span.snippet);
        closed.push('}');
        if let Ok(v) = serde_json::from_str(&closed) {
            return Some(v);
        }
        let mut stripped_closed = stripped;
        stripped_closed.push('}');
        if let Ok(v) = serde_json::from_str(&stripped_closed) {
            return Some(v);
        }
    }
    None
}

/// Remove `,` immediately preceding `}` or `]`, outside string values.
fn strip_trailing_commas(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
                i += 1;
            }
            ',' => {
                let mut j = i + 1;
                while j < chars.len() && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                    i += 1; // drop the comma
                } else {
                    out.push(c);
                    i += 1;
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Map an accepted JSON shape onto a call record; `None` for objects that
/// are JSON but not tool calls.
fn interpret(value: &Value, index: usize) -> Option<ToolCallRecord> {
    let obj = value.as_object()?;

    if let Some(name) = obj.get("name").and_then(Value::as_str) {
        return Some(record(index, name, normalize_args(obj.get("arguments"))));
    }
    if let Some(func) = obj.get("function").and_then(Value::as_object) {
        if let Some(name) = func.get("name").and_then(Value::as_str) {
            return Some(record(index, name, normalize_args(func.get("arguments"))));
        }
    }
    if let Some(name) = obj.get("tool").and_then(Value::as_str) {
        return Some(record(index, name, normalize_args(obj.get("args"))));
    }
    None
}

fn record(index: usize, name: &str, arguments: Value) -> ToolCallRecord {
    ToolCallRecord {
        id: format!("text-call-{index}"),
        name: name.to_string(),
        arguments,
    }
}

/// Arguments may arrive as an object, a JSON-encoded string, or be absent.
/// Everything resolves to an object; a non-object leftover is dropped to
/// `{}` rather than poisoning the dispatch.
fn normalize_args(args: Option<&Value>) -> Value {
    match args {
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(Value::String(s)) => {
            serde_json::from_str(s).unwrap_or_else(|_| Value::Object(Default::default()))
        }
        _ => Value::Object(Default::default()),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
