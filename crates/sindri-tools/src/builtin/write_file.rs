// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::builtin::resolve;
use crate::tool::{Tool, ToolResult};

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a file, overwriting any existing content at the path. \
         Creates parent directories automatically. \
         Relative paths are resolved against the task working directory."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write to the file"
                }
            },
            "required": ["path", "content"]
        })
    }

    fn is_write_class(&self) -> bool {
        true
    }

    async fn execute(&self, args: &Value, work_dir: &Path) -> ToolResult {
        let Some(path) = args.get("path").and_then(Value::as_str) else {
            return ToolResult::agent_error("missing required parameter 'path'");
        };
        let Some(content) = args.get("content").and_then(Value::as_str) else {
            return ToolResult::agent_error("missing required parameter 'content'");
        };
        let target = resolve(work_dir, path);
        debug!(path = %target.display(), bytes = content.len(), "write_file");

        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
        }
        match tokio::fs::write(&target, content).await {
            Ok(()) => ToolResult::ok(format!("wrote {} bytes to {path}", content.len())),
            Err(e) => ToolResult::agent_error(format!("write error for {path}: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn write_creates_file_in_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        let out = WriteFileTool
            .execute(&json!({"path": "out.txt", "content": "hello"}), dir.path())
            .await;
        assert!(out.success, "{:?}", out.error);
        let body = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(body, "hello");
    }

    #[tokio::test]
    async fn write_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let out = WriteFileTool
            .execute(&json!({"path": "a/b/c.txt", "content": "x"}), dir.path())
            .await;
        assert!(out.success);
        assert!(dir.path().join("a/b/c.txt").exists());
    }

    #[tokio::test]
    async fn missing_path_is_agent_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = WriteFileTool
            .execute(&json!({"content": "x"}), dir.path())
            .await;
        assert!(!out.success);
        assert!(out.feedback().contains("'path'"));
    }

    #[test]
    fn is_write_class() {
        assert!(WriteFileTool.is_write_class());
    }
}
