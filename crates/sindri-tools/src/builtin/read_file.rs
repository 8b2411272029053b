// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::builtin::resolve;
use crate::tool::{Tool, ToolResult};

/// Upper bound on returned content; larger files are truncated with a
/// marker so a single read cannot blow the context budget.
const MAX_BYTES: usize = 128 * 1024;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file and return its contents. \
         Relative paths are resolved against the task working directory."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: &Value, work_dir: &Path) -> ToolResult {
        let Some(path) = args.get("path").and_then(Value::as_str) else {
            return ToolResult::agent_error("missing required parameter 'path'");
        };
        let target = resolve(work_dir, path);
        match tokio::fs::read_to_string(&target).await {
            Ok(mut text) => {
                if text.len() > MAX_BYTES {
                    let mut cut = MAX_BYTES;
                    while !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    text.truncate(cut);
                    text.push_str("\n[... truncated]");
                }
                ToolResult::ok(text)
            }
            Err(e) => ToolResult::agent_error(format!("cannot read {path}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn reads_relative_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), "body").unwrap();
        let out = ReadFileTool
            .execute(&json!({"path": "f.txt"}), dir.path())
            .await;
        assert!(out.success);
        assert_eq!(out.output, "body");
    }

    #[tokio::test]
    async fn missing_file_is_agent_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = ReadFileTool
            .execute(&json!({"path": "nope.txt"}), dir.path())
            .await;
        assert!(!out.success);
        assert!(out.feedback().contains("cannot read"));
    }

    #[tokio::test]
    async fn long_file_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(MAX_BYTES + 10)).unwrap();
        let out = ReadFileTool
            .execute(&json!({"path": "big.txt"}), dir.path())
            .await;
        assert!(out.success);
        assert!(out.output.ends_with("[... truncated]"));
    }
}
