// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use sindri_model::ErrorCategory;

use crate::tool::{Tool, ToolResult};

const MAX_BODY_BYTES: usize = 64 * 1024;

/// Fetch a URL and return the response body as text.
pub struct HttpFetchTool {
    pub timeout_secs: u64,
}

impl Default for HttpFetchTool {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

#[async_trait]
impl Tool for HttpFetchTool {
    fn name(&self) -> &str {
        "http_fetch"
    }

    fn description(&self) -> &str {
        "Fetch a URL with HTTP GET and return the body as text (truncated to 64 KiB)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The http(s) URL to fetch"
                }
            },
            "required": ["url"]
        })
    }

    async fn execute(&self, args: &Value, _work_dir: &Path) -> ToolResult {
        let Some(url) = args.get("url").and_then(Value::as_str) else {
            return ToolResult::agent_error("missing required parameter 'url'");
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return ToolResult::agent_error(format!("not an http(s) url: {url}"));
        }

        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                return ToolResult::fail(
                    ErrorCategory::Fatal,
                    format!("http client init failed: {e}"),
                )
            }
        };

        let resp = match client.get(url).send().await {
            Ok(r) => r,
            // Network-level failures are transient and worth a retry.
            Err(e) => return ToolResult::fail(ErrorCategory::Transient, format!("fetch failed: {e}")),
        };
        let status = resp.status();
        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => {
                return ToolResult::fail(ErrorCategory::Transient, format!("read body failed: {e}"))
            }
        };
        if !status.is_success() {
            return ToolResult::agent_error(format!("HTTP {status} from {url}"));
        }
        let mut text = body;
        if text.len() > MAX_BODY_BYTES {
            let mut cut = MAX_BODY_BYTES;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str("\n[... truncated]");
        }
        ToolResult::ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn missing_url_is_agent_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = HttpFetchTool::default().execute(&json!({}), dir.path()).await;
        assert!(!out.success);
        assert_eq!(out.category, Some(ErrorCategory::Agent));
    }

    #[tokio::test]
    async fn non_http_scheme_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let out = HttpFetchTool::default()
            .execute(&json!({"url": "file:///etc/passwd"}), dir.path())
            .await;
        assert!(!out.success);
        assert!(out.feedback().contains("not an http(s) url"));
    }
}
