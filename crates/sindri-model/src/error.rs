// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// Failure classification shared by the backend, the tool layer, and the
/// agent loop.  The category decides retry and propagation behavior:
///
/// - `Transient` — network hiccups, timeouts, lock contention.  Retried
///   with backoff.
/// - `Resource` — VRAM exhaustion, model-load failure.  Triggers model
///   fallback; never retried blindly.
/// - `Fatal` — schema or invariant violations.  Aborts the task.
/// - `Agent` — malformed tool args, unknown tools, invalid delegation
///   targets.  Reported back to the model as a failed tool result so it
///   can correct itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    Resource,
    Fatal,
    Agent,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::Resource => "resource",
            Self::Fatal => "fatal",
            Self::Agent => "agent",
        };
        write!(f, "{s}")
    }
}

/// Error returned by an [`crate::LlmBackend`] implementation.
#[derive(Debug, thiserror::Error)]
#[error("{category} backend error: {message}")]
pub struct BackendError {
    pub category: ErrorCategory,
    pub message: String,
}

impl BackendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Transient,
            message: message.into(),
        }
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Resource,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Fatal,
            message: message.into(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
