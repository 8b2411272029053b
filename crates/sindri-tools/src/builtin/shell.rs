// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use sindri_model::ErrorCategory;
use tracing::debug;

use crate::tool::{Tool, ToolResult};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Run a shell command in the task working directory.
///
/// Wall-clock bounding happens here, inside the tool, via the per-call
/// timeout; the kernel imposes no timeouts of its own.
pub struct ShellTool {
    pub timeout_secs: u64,
}

impl Default for ShellTool {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the task working directory and return \
         combined stdout/stderr.  Commands are killed after the timeout."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command line to run with `sh -c`"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Override the default timeout"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: &Value, work_dir: &Path) -> ToolResult {
        let Some(command) = args.get("command").and_then(Value::as_str) else {
            return ToolResult::agent_error("missing required parameter 'command'");
        };
        let timeout = args
            .get("timeout_secs")
            .and_then(Value::as_u64)
            .unwrap_or(self.timeout_secs);
        debug!(command, timeout, "shell");

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(work_dir)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(Duration::from_secs(timeout), child).await {
            Err(_) => ToolResult::fail(
                ErrorCategory::Transient,
                format!("command timed out after {timeout}s"),
            ),
            Ok(Err(e)) => ToolResult::fail(
                ErrorCategory::Fatal,
                format!("failed to spawn shell: {e}"),
            ),
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).to_string();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.is_empty() {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(&stderr);
                }
                if output.status.success() {
                    ToolResult::ok(text)
                } else {
                    ToolResult::agent_error(format!(
                        "command exited with {}:\n{text}",
                        output
                            .status
                            .code()
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "signal".into())
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn echo_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let out = ShellTool::default()
            .execute(&json!({"command": "echo ok"}), dir.path())
            .await;
        assert!(out.success);
        assert_eq!(out.output.trim(), "ok");
    }

    #[tokio::test]
    async fn runs_in_work_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), "").unwrap();
        let out = ShellTool::default()
            .execute(&json!({"command": "ls"}), dir.path())
            .await;
        assert!(out.output.contains("marker"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_agent_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = ShellTool::default()
            .execute(&json!({"command": "exit 3"}), dir.path())
            .await;
        assert!(!out.success);
        assert_eq!(out.category, Some(ErrorCategory::Agent));
        assert!(out.feedback().contains("exited with 3"));
    }

    #[tokio::test]
    async fn timeout_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let out = ShellTool { timeout_secs: 1 }
            .execute(&json!({"command": "sleep 5"}), dir.path())
            .await;
        assert!(!out.success);
        assert_eq!(out.category, Some(ErrorCategory::Transient));
    }

    #[tokio::test]
    async fn missing_command_is_agent_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = ShellTool::default().execute(&json!({}), dir.path()).await;
        assert!(!out.success);
        assert_eq!(out.category, Some(ErrorCategory::Agent));
    }
}
