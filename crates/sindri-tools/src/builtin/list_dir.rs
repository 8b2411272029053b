// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::builtin::resolve;
use crate::tool::{Tool, ToolResult};

pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List the entries of a directory, one per line; directories carry a \
         trailing slash.  Defaults to the task working directory."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (default: working directory)"
                }
            }
        })
    }

    async fn execute(&self, args: &Value, work_dir: &Path) -> ToolResult {
        let path = args.get("path").and_then(Value::as_str).unwrap_or(".");
        let target = resolve(work_dir, path);
        let mut rd = match tokio::fs::read_dir(&target).await {
            Ok(rd) => rd,
            Err(e) => return ToolResult::agent_error(format!("cannot list {path}: {e}")),
        };
        let mut lines = Vec::new();
        while let Ok(Some(entry)) = rd.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            lines.push(if is_dir { format!("{name}/") } else { name });
        }
        lines.sort();
        ToolResult::ok(lines.join("\n"))
    }
}
