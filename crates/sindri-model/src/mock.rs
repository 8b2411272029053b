// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    BackendError, ChatResponse, ErrorCategory, LlmBackend, TokenSender, ToolCallRecord,
    ToolSchema, Turn, Usage,
};

/// Deterministic mock backend for tests.  Echoes the last user message back
/// as the assistant response.
#[derive(Default)]
pub struct MockBackend;

#[async_trait]
impl LlmBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn chat(
        &self,
        _model: &str,
        messages: &[Turn],
        _tools: &[ToolSchema],
    ) -> Result<ChatResponse, BackendError> {
        let reply = messages
            .iter()
            .rev()
            .find(|m| m.role == crate::Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("[no input]");
        Ok(ChatResponse {
            text: format!("MOCK: {reply}"),
            native_tool_calls: vec![],
            usage: Usage {
                input_tokens: 10,
                output_tokens: 10,
            },
        })
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: &[Turn],
        tools: &[ToolSchema],
        on_token: TokenSender,
    ) -> Result<ChatResponse, BackendError> {
        let resp = self.chat(model, messages, tools).await?;
        stream_text(&resp.text, &on_token).await;
        Ok(resp)
    }

    async fn load(&self, _model: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn unload(&self, _model: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        Ok(vec!["mock-model".into()])
    }
}

/// One scripted completion: either a response or a tagged failure.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCallRecord>,
    /// When set, the call fails with this category instead of responding.
    pub error: Option<ErrorCategory>,
}

impl ScriptedResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: vec![],
            error: None,
        }
    }

    /// Add a native tool call to this response.
    pub fn with_tool_call(
        mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        self.tool_calls.push(ToolCallRecord {
            id: id.into(),
            name: name.into(),
            arguments,
        });
        self
    }

    pub fn failure(category: ErrorCategory) -> Self {
        Self {
            text: String::new(),
            tool_calls: vec![],
            error: Some(category),
        }
    }
}

/// A pre-scripted backend.  Each chat call pops the next script from the
/// front of the queue, so tests can specify exact multi-round conversations
/// — including native tool calls and tagged failures — without network
/// access.  Load/unload calls are recorded for model-manager assertions, and
/// specific models can be scripted to fail loading with a RESOURCE error.
pub struct ScriptedBackend {
    scripts: Mutex<VecDeque<ScriptedResponse>>,
    /// Message lists seen by each chat call, for request inspection.
    pub requests: Mutex<Vec<Vec<Turn>>>,
    /// Every model name passed to `load`, in call order.
    pub loads: Mutex<Vec<String>>,
    /// Every model name passed to `unload`, in call order.
    pub unloads: Mutex<Vec<String>>,
    failing_loads: Mutex<HashSet<String>>,
}

impl ScriptedBackend {
    pub fn new(scripts: Vec<ScriptedResponse>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            loads: Mutex::new(Vec::new()),
            unloads: Mutex::new(Vec::new()),
            failing_loads: Mutex::new(HashSet::new()),
        }
    }

    /// Backend that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![ScriptedResponse::text(reply)])
    }

    /// Backend that emits one native tool call, then a text reply.
    pub fn tool_then_text(
        tool_name: impl Into<String>,
        arguments: serde_json::Value,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            ScriptedResponse::text("").with_tool_call("call-1", tool_name, arguments),
            ScriptedResponse::text(final_text),
        ])
    }

    /// Declare that `load(model)` must fail with a RESOURCE error.
    pub fn fail_load(self, model: impl Into<String>) -> Self {
        self.failing_loads.lock().unwrap().insert(model.into());
        self
    }

    fn next_script(&self) -> ScriptedResponse {
        let mut scripts = self.scripts.lock().unwrap();
        scripts
            .pop_front()
            .unwrap_or_else(|| ScriptedResponse::text("[no more scripts]"))
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    async fn chat(
        &self,
        _model: &str,
        messages: &[Turn],
        _tools: &[ToolSchema],
    ) -> Result<ChatResponse, BackendError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        let script = self.next_script();
        if let Some(category) = script.error {
            return Err(BackendError {
                category,
                message: "scripted failure".into(),
            });
        }
        Ok(ChatResponse {
            text: script.text,
            native_tool_calls: script.tool_calls,
            usage: Usage {
                input_tokens: 5,
                output_tokens: 5,
            },
        })
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: &[Turn],
        tools: &[ToolSchema],
        on_token: TokenSender,
    ) -> Result<ChatResponse, BackendError> {
        let resp = self.chat(model, messages, tools).await?;
        stream_text(&resp.text, &on_token).await;
        Ok(resp)
    }

    async fn load(&self, model: &str) -> Result<(), BackendError> {
        self.loads.lock().unwrap().push(model.to_string());
        if self.failing_loads.lock().unwrap().contains(model) {
            return Err(BackendError::resource(format!("cannot load {model}")));
        }
        Ok(())
    }

    async fn unload(&self, model: &str) -> Result<(), BackendError> {
        self.unloads.lock().unwrap().push(model.to_string());
        Ok(())
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        Ok(vec!["scripted-mock-model".into()])
    }
}

/// Send `text` through the token channel in small chunks, preserving order.
async fn stream_text(text: &str, on_token: &TokenSender) {
    for chunk in text.as_bytes().chunks(8) {
        // Chunks are produced from a valid str at fixed byte offsets; a
        // multi-byte boundary split would be a test-input artifact, so fall
        // back to lossy conversion rather than panic.
        let piece = String::from_utf8_lossy(chunk).to_string();
        if on_token.send(piece).await.is_err() {
            break;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
