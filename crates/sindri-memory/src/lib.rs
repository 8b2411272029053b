// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod context;
mod embed;
mod index;
mod indexer;
mod patterns;

pub use context::{ContextBuilder, TokenCounter};
pub use embed::{Embedder, HashingEmbedder};
pub use index::{InMemoryIndex, SearchHit, VectorIndex};
pub use indexer::ProjectIndexer;
pub use patterns::PatternStore;
