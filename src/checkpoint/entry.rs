//! Checkpoint log entries
//!
//! A segment holds a sequence of entries. `Batch` carries window updates in
//! the order they were queued; `Compacted` is a complete snapshot that
//! supersedes every entry before it in the chain.

use serde::{Deserialize, Serialize};

use super::errors::{CheckpointError, CheckpointResult};
use super::window::{CompactedState, WindowUpdate};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CheckpointEntry {
    Batch(Vec<WindowUpdate>),
    Compacted(CompactedState),
}

impl CheckpointEntry {
    pub fn kind(&self) -> &'static str {
        match self {
            CheckpointEntry::Batch(_) => "batch",
            CheckpointEntry::Compacted(_) => "compacted",
        }
    }

    pub fn encode(&self) -> CheckpointResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            CheckpointError::serialization(format!("failed to encode {} entry: {}", self.kind(), e))
        })
    }

    pub fn decode(bytes: &[u8]) -> CheckpointResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| CheckpointError::serialization(format!("failed to decode entry: {}", e)))
    }
}
