// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{BackendError, ChatResponse, ToolSchema, Turn};

/// Channel end that receives streamed tokens, in emission order.
pub type TokenSender = mpsc::Sender<String>;

/// Transport abstraction over a local model server.
///
/// The kernel drives every completion through this trait; concrete
/// implementations (llama.cpp, Ollama, vLLM, ...) live outside the kernel.
/// Errors carry an [`crate::ErrorCategory`] so the agent loop can decide
/// between retry, model fallback, and task failure.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Human-readable backend name for status display.
    fn name(&self) -> &str;

    /// One blocking completion.
    async fn chat(
        &self,
        model: &str,
        messages: &[Turn],
        tools: &[ToolSchema],
    ) -> Result<ChatResponse, BackendError>;

    /// One streaming completion.  Every token is sent through `on_token` in
    /// order before the buffered [`ChatResponse`] is returned; the returned
    /// `text` is the concatenation of all streamed tokens.
    ///
    /// Implementations must tolerate the receiver being dropped mid-stream
    /// (send failures are not errors — the consumer simply stopped
    /// listening).
    async fn chat_stream(
        &self,
        model: &str,
        messages: &[Turn],
        tools: &[ToolSchema],
        on_token: TokenSender,
    ) -> Result<ChatResponse, BackendError>;

    /// Make the model resident.  A second load of an already-resident model
    /// is a no-op.
    async fn load(&self, model: &str) -> Result<(), BackendError>;

    /// Release the model's VRAM.
    async fn unload(&self, model: &str) -> Result<(), BackendError>;

    /// Model identifiers this backend can serve.
    async fn list_models(&self) -> Result<Vec<String>, BackendError>;
}
