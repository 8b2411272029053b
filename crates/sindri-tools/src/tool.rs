// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

use sindri_model::ErrorCategory;

/// The result of executing a tool.
///
/// Tools never return `Err`; every failure is expressed as a `ToolResult`
/// with `success = false` and a category that drives the retry and
/// propagation policy.  AGENT-category failures flow back to the model as
/// tool output so it can correct itself.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    /// Set on failures only.
    pub category: Option<ErrorCategory>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            category: None,
        }
    }

    pub fn fail(category: ErrorCategory, msg: impl Into<String>) -> Self {
        let msg = msg.into();
        Self {
            success: false,
            output: String::new(),
            error: Some(msg),
            category: Some(category),
        }
    }

    /// AGENT-class failure: the model supplied bad input and should retry
    /// with corrected arguments.
    pub fn agent_error(msg: impl Into<String>) -> Self {
        Self::fail(ErrorCategory::Agent, msg)
    }

    /// True when the failure is worth retrying at the kernel level.
    pub fn retriable(&self) -> bool {
        self.category == Some(ErrorCategory::Transient)
    }

    /// Text to feed back to the model as the tool turn.
    pub fn feedback(&self) -> String {
        if self.success {
            self.output.clone()
        } else {
            format!(
                "error: {}",
                self.error.as_deref().unwrap_or("tool failed")
            )
        }
    }
}

/// Trait every tool implements.  Dispatch is by name through the registry;
/// no inheritance hierarchy exists beyond this single trait.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the argument object.
    fn parameters_schema(&self) -> Value;
    /// Write-class tools (file creation/edit) satisfy the completion
    /// validator's requirement that edit tasks performed real work.
    fn is_write_class(&self) -> bool {
        false
    }
    /// Execute with parsed arguments, relative paths resolved under
    /// `work_dir`.  Must not panic; failures are returned as results.
    async fn execute(&self, args: &Value, work_dir: &Path) -> ToolResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
