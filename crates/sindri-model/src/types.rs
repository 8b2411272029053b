// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation in a serializable shape.
///
/// This is the only form in which tool calls cross the persistence boundary;
/// backend-native handles never leave the backend implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Call id, forwarded verbatim when the backend provided one.
    pub id: String,
    pub name: String,
    /// Parsed JSON argument object.
    pub arguments: serde_json::Value,
}

/// One entry in a session's conversation log.
///
/// Turns are append-only: once recorded, a turn is never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    /// Present on assistant turns that requested tool calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRecord>>,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCallRecord>) -> Self {
        let mut t = Self::new(Role::Assistant, content);
        t.tool_calls = Some(calls);
        t
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            timestamp: Utc::now(),
        }
    }

    /// Approximate token count using the 4-chars-per-token heuristic.
    pub fn approx_tokens(&self) -> usize {
        let call_chars: usize = self
            .tool_calls
            .iter()
            .flatten()
            .map(|c| c.name.len() + c.arguments.to_string().len())
            .sum();
        ((self.content.len() + call_chars) / 4).max(1)
    }
}

/// A tool schema handed to the backend for native tool-call support.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: serde_json::Value,
}

/// Uniform response from one chat call, streaming or not.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub text: String,
    /// Tool calls the backend parsed natively.  Empty when the backend has
    /// no tool-call protocol and the text parser must take over.
    pub native_tool_calls: Vec<ToolCallRecord>,
    pub usage: Usage,
}

/// Token usage from one call.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn turn_constructors_set_role() {
        assert_eq!(Turn::system("s").role, Role::System);
        assert_eq!(Turn::user("u").role, Role::User);
        assert_eq!(Turn::assistant("a").role, Role::Assistant);
        assert_eq!(Turn::tool("t").role, Role::Tool);
    }

    #[test]
    fn assistant_with_calls_carries_records() {
        let calls = vec![ToolCallRecord {
            id: "c1".into(),
            name: "write_file".into(),
            arguments: json!({"path": "x"}),
        }];
        let t = Turn::assistant_with_calls("doing it", calls.clone());
        assert_eq!(t.tool_calls, Some(calls));
    }

    #[test]
    fn approx_tokens_divides_by_four_with_floor_of_one() {
        assert_eq!(Turn::user("12345678").approx_tokens(), 2);
        assert_eq!(Turn::user("hi").approx_tokens(), 1);
        assert_eq!(Turn::user("").approx_tokens(), 1);
    }

    #[test]
    fn approx_tokens_counts_tool_call_payload() {
        let t = Turn::assistant_with_calls(
            "",
            vec![ToolCallRecord {
                id: "c".into(),
                name: "aaaa".into(),
                arguments: json!({}),
            }],
        );
        // 4 name chars + 2 argument chars ("{}") → 6/4 → 1
        assert_eq!(t.approx_tokens(), 1);
    }

    #[test]
    fn turn_round_trips_through_json() {
        let t = Turn::assistant_with_calls(
            "text",
            vec![ToolCallRecord {
                id: "id".into(),
                name: "shell".into(),
                arguments: json!({"command": "ls"}),
            }],
        );
        let json = serde_json::to_string(&t).unwrap();
        let back: Turn = serde_json::from_str(&json).unwrap();
        assert_eq!(back.role, Role::Assistant);
        assert_eq!(back.content, "text");
        assert_eq!(back.tool_calls.unwrap()[0].name, "shell");
    }

    #[test]
    fn tool_calls_field_omitted_when_absent() {
        let json = serde_json::to_string(&Turn::user("hi")).unwrap();
        assert!(!json.contains("tool_calls"));
    }
}
