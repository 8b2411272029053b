// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use sindri_model::{ToolCallRecord, ToolSchema};

use crate::retry::RetryPolicy;
use crate::tool::{Tool, ToolResult};

/// Central registry holding all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Shared handles to every registered tool, for building per-task
    /// registry views.
    pub fn arcs(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_write_class(&self, name: &str) -> bool {
        self.tools
            .get(name)
            .map(|t| t.is_write_class())
            .unwrap_or(false)
    }

    /// Schemas for ALL registered tools, name-sorted.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Schemas restricted to an agent's whitelist.  Unknown names are
    /// silently absent — the agent simply cannot call them.
    pub fn schemas_for(&self, allowed: &[String]) -> Vec<ToolSchema> {
        self.schemas()
            .into_iter()
            .filter(|s| allowed.iter().any(|a| a == &s.name))
            .collect()
    }

    /// Dispatch one call without retry.  Unknown tools come back as an
    /// AGENT-class failure the model can react to.
    pub async fn execute(&self, call: &ToolCallRecord, work_dir: &Path) -> ToolResult {
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(&call.arguments, work_dir).await,
            None => ToolResult::agent_error(format!("unknown tool: {}", call.name)),
        }
    }

    /// Dispatch one call under the retry policy: TRANSIENT failures are
    /// retried with exponential backoff, everything else surfaces once.
    pub async fn execute_with_retry(
        &self,
        call: &ToolCallRecord,
        work_dir: &Path,
        policy: &RetryPolicy,
    ) -> ToolResult {
        let mut attempt = 1u32;
        loop {
            let result = self.execute(call, work_dir).await;
            if result.success || !result.retriable() || attempt >= policy.max_attempts {
                return result;
            }
            tokio::time::sleep(policy.delay(attempt)).await;
            attempt += 1;
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use sindri_model::ErrorCategory;

    use super::*;

    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, args: &Value, _work_dir: &Path) -> ToolResult {
            ToolResult::ok(format!("echo:{args}"))
        }
    }

    /// Fails with TRANSIENT until the given attempt, then succeeds.
    struct FlakyTool {
        succeed_on: u32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "fails transiently"
        }
        fn parameters_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn execute(&self, _args: &Value, _work_dir: &Path) -> ToolResult {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_on {
                ToolResult::ok("recovered")
            } else {
                ToolResult::fail(ErrorCategory::Transient, "flaky failure")
            }
        }
    }

    fn call(name: &str) -> ToolCallRecord {
        ToolCallRecord {
            id: "c1".into(),
            name: name.into(),
            arguments: json!({}),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base: std::time::Duration::from_millis(1),
            max: std::time::Duration::from_millis(2),
            multiplier: 2.0,
            max_attempts: 3,
        }
    }

    #[tokio::test]
    async fn execute_known_tool() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "echo" });
        let out = reg.execute(&call("echo"), Path::new(".")).await;
        assert!(out.success);
        assert!(out.output.starts_with("echo:"));
    }

    #[tokio::test]
    async fn unknown_tool_is_agent_error() {
        let reg = ToolRegistry::new();
        let out = reg.execute(&call("missing"), Path::new(".")).await;
        assert!(!out.success);
        assert_eq!(out.category, Some(ErrorCategory::Agent));
        assert!(out.feedback().contains("unknown tool"));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let mut reg = ToolRegistry::new();
        reg.register(FlakyTool {
            succeed_on: 3,
            attempts: AtomicU32::new(0),
        });
        let out = reg
            .execute_with_retry(&call("flaky"), Path::new("."), &fast_policy())
            .await;
        assert!(out.success, "third attempt should have succeeded");
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let mut reg = ToolRegistry::new();
        reg.register(FlakyTool {
            succeed_on: 10,
            attempts: AtomicU32::new(0),
        });
        let out = reg
            .execute_with_retry(&call("flaky"), Path::new("."), &fast_policy())
            .await;
        assert!(!out.success);
        assert_eq!(out.category, Some(ErrorCategory::Transient));
    }

    #[tokio::test]
    async fn agent_errors_are_not_retried() {
        struct BadArgsTool {
            attempts: AtomicU32,
        }
        #[async_trait]
        impl Tool for BadArgsTool {
            fn name(&self) -> &str {
                "bad"
            }
            fn description(&self) -> &str {
                "always rejects"
            }
            fn parameters_schema(&self) -> Value {
                json!({ "type": "object" })
            }
            async fn execute(&self, _args: &Value, _work_dir: &Path) -> ToolResult {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                ToolResult::agent_error("bad args")
            }
        }
        let mut reg = ToolRegistry::new();
        reg.register(BadArgsTool {
            attempts: AtomicU32::new(0),
        });
        let out = reg
            .execute_with_retry(&call("bad"), Path::new("."), &fast_policy())
            .await;
        assert!(!out.success);
        assert_eq!(out.category, Some(ErrorCategory::Agent));
    }

    #[test]
    fn schemas_for_filters_to_whitelist() {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool { name: "a" });
        reg.register(EchoTool { name: "b" });
        let schemas = reg.schemas_for(&["b".to_string(), "zz".to_string()]);
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].name, "b");
    }
}
