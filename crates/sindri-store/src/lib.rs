// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod records;
mod store;

pub use records::{
    ChunkRecord, CheckpointRecord, EpisodeRecord, PatternRecord, SessionRecord, SessionStatus,
};
pub use store::{SessionStore, StoreError};
