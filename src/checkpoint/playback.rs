//! Chain playback
//!
//! Rebuilds window state by folding every entry of every segment in chain
//! order. A `Compacted` entry replaces the accumulated state, filter
//! included; a `Batch` entry folds its updates through the registered
//! aggregations. Segments are read in chunks up to their last confirmed
//! entry. Any read or decode failure aborts playback.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use super::entry::CheckpointEntry;
use super::errors::CheckpointResult;
use super::store::{LedgerHandle, LedgerId, LogStore};
use super::window::{WindowAggregations, WindowState};
use crate::observability::MetricsRegistry;

/// Counts from one playback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlaybackStats {
    pub segments: u64,
    pub entries: u64,
    pub batches: u64,
    pub compactions: u64,
    pub updates_applied: u64,
    /// Updates skipped because their dedup id was already in the filter
    pub duplicates_skipped: u64,
}

/// Reads segments back out of a log store.
pub struct PlaybackEngine {
    store: Arc<dyn LogStore>,
    aggregations: WindowAggregations,
    chunk_size: u64,
    password: Vec<u8>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl std::fmt::Debug for PlaybackEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackEngine")
            .field("aggregations", &self.aggregations)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl PlaybackEngine {
    pub fn new(
        store: Arc<dyn LogStore>,
        aggregations: WindowAggregations,
        chunk_size: u64,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            store,
            aggregations,
            chunk_size: chunk_size.max(1),
            password: password.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Fold every segment of `chain`, oldest first, into `initial`.
    pub fn replay(
        &self,
        chain: &[LedgerId],
        initial: WindowState,
    ) -> CheckpointResult<(WindowState, PlaybackStats)> {
        let mut state = initial;
        let mut stats = PlaybackStats::default();
        for &id in chain {
            self.replay_segment(id, &mut state, &mut stats)?;
        }
        if let Some(metrics) = &self.metrics {
            metrics.add_playback_entries(stats.entries);
        }
        info!(
            segments = stats.segments,
            entries = stats.entries,
            compactions = stats.compactions,
            updates = stats.updates_applied,
            duplicates = stats.duplicates_skipped,
            "chain playback complete"
        );
        Ok((state, stats))
    }

    fn replay_segment(
        &self,
        id: LedgerId,
        state: &mut WindowState,
        stats: &mut PlaybackStats,
    ) -> CheckpointResult<()> {
        let entries = self.read_segment(id)?;
        debug!(ledger = id, entries = entries.len(), "replaying ledger");
        stats.segments += 1;
        for entry in entries {
            self.apply(entry, state, stats)?;
        }
        Ok(())
    }

    fn apply(
        &self,
        entry: CheckpointEntry,
        state: &mut WindowState,
        stats: &mut PlaybackStats,
    ) -> CheckpointResult<()> {
        stats.entries += 1;
        match entry {
            CheckpointEntry::Compacted(compacted) => {
                *state = WindowState::from_compacted(&compacted);
                stats.compactions += 1;
            }
            CheckpointEntry::Batch(updates) => {
                stats.batches += 1;
                for update in &updates {
                    if state.apply_update(update, &self.aggregations)? {
                        stats.updates_applied += 1;
                    } else {
                        stats.duplicates_skipped += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Decode every confirmed entry of one segment.
    pub fn read_segment(&self, id: LedgerId) -> CheckpointResult<Vec<CheckpointEntry>> {
        let handle = self.store.open(id, &self.password)?;
        let Some(last) = self.store.last_confirmed(&handle)? else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::with_capacity(last as usize + 1);
        let mut first = 0;
        while first <= last {
            let end = last.min(first + self.chunk_size - 1);
            entries.extend(self.read_chunk(&handle, first, end)?);
            first = end + 1;
        }
        Ok(entries)
    }

    fn read_chunk(
        &self,
        handle: &LedgerHandle,
        first: u64,
        last: u64,
    ) -> CheckpointResult<Vec<CheckpointEntry>> {
        self.store
            .read_entries(handle, first, last)?
            .iter()
            .map(|bytes| CheckpointEntry::decode(bytes))
            .collect()
    }
}
