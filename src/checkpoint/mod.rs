//! Checkpoint log for windowed task state
//!
//! Window updates are persisted as entries in a chain of append-only
//! segments ("ledgers") per task slot. The coordination service holds the
//! registered chain; the last segment is the active one and the only one
//! written to.
//!
//! # Components
//!
//! - `BatchWriter`: coalesces submitted updates into `Batch` entries and
//!   appends them to the active segment, acknowledging callers once durable
//! - `ChainManager`: owns the active/pending segment pointers and runs the
//!   compaction transition
//! - `PlaybackEngine`: rebuilds window state from a chain
//!
//! # Chain lifecycle
//!
//! ```text
//! start:       [a b c]          replay a, b, c; register d
//!              [a b c d]        d active
//! compaction:  [a b c d e]      e registered and pending
//!              writer swaps to e, writes snapshot s of state
//!              [s e]            prefix a..d replaced once s is durable
//! ```
//!
//! # Guarantees
//!
//! - A caller's completion callback runs only after its updates are durable
//! - Entries of one segment are read back in write order
//! - Replaying the chain at any point of a compaction yields the same state:
//!   the snapshot is taken from the writer's own state, which only holds
//!   batches already handed to a segment
//! - A segment swapped out by compaction is closed only after every append
//!   issued against it has completed
//! - A compaction whose pending segment lost a registration race is
//!   abandoned and the active segment is left open
//!
//! # Failures
//!
//! Playback failures are fatal for the task: a chain that cannot be read
//! back is not silently truncated. Append failures are reported to the
//! callbacks of the affected batch.

mod chain;
mod coordination;
mod entry;
mod errors;
mod file_store;
mod marker;
mod playback;
mod store;
mod window;
mod writer;

pub use chain::{ChainManager, TransitionOutcome};
pub use coordination::{CoordinationCommand, Coordinator, MemoryCoordinator, TaskSlot};
pub use entry::CheckpointEntry;
pub use errors::{CheckpointError, CheckpointErrorCode, CheckpointResult, Severity};
pub use file_store::FileLogStore;
pub use marker::{ledger_path, marker_path, LedgerMarker};
pub use playback::{PlaybackEngine, PlaybackStats};
pub use store::{
    AppendCallback, DigestType, EntryId, LedgerHandle, LedgerId, LedgerOptions, LogStore,
    MemoryLogStore,
};
pub use window::{
    numeric_sum, AggregateFn, CompactedState, DedupFilter, ExtentKey, ExtentRecord,
    SharedWindowState, StateSnapshotSource, WindowAggregations, WindowId, WindowState,
    WindowUpdate,
};
pub use writer::{BatchWriter, WriteCallback};

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::info;

use crate::config::CheckpointConfig;
use crate::messaging::PeerId;
use crate::observability::MetricsRegistry;

/// Checkpoint log of one task slot: recovered state plus a running writer.
#[derive(Debug)]
pub struct CheckpointLog {
    writer: BatchWriter,
    state: SharedWindowState,
    aggregations: WindowAggregations,
    playback: PlaybackStats,
}

impl CheckpointLog {
    /// Replay the registered chain, then register a fresh active segment
    /// and start the writer.
    pub fn open(
        slot: TaskSlot,
        peer_id: PeerId,
        store: Arc<dyn LogStore>,
        coordinator: Arc<dyn Coordinator>,
        config: &CheckpointConfig,
        aggregations: WindowAggregations,
        metrics: Arc<MetricsRegistry>,
    ) -> CheckpointResult<Self> {
        let chain = coordinator.registered_chain(&slot)?;
        let engine = PlaybackEngine::new(
            Arc::clone(&store),
            aggregations.clone(),
            config.read_chunk_size,
            config.ledger_password.as_bytes().to_vec(),
        )
        .with_metrics(Arc::clone(&metrics));
        let (recovered, playback) = engine.replay(&chain, WindowState::new())?;
        let state = SharedWindowState::new(recovered);

        let manager = ChainManager::start(
            slot,
            peer_id,
            store,
            coordinator,
            config,
            Arc::clone(&metrics),
        )?;
        info!(
            slot = %manager.slot(),
            replayed = ?chain,
            active = manager.active_id(),
            "checkpoint log opened"
        );
        let writer = BatchWriter::start(
            Arc::new(manager),
            state.current(),
            aggregations.clone(),
            config,
            metrics,
        )?;

        Ok(Self {
            writer,
            state,
            aggregations,
            playback,
        })
    }

    /// Queue updates for writing and apply them to the window state.
    ///
    /// Updates whose dedup id was already seen are neither applied nor
    /// written. The state changes only once the writer has accepted the
    /// updates; on error it is untouched. Returns how many were applied; if
    /// none were, `on_complete` runs immediately.
    ///
    /// The state stays locked while the updates are queued, so queue order
    /// matches the order in which they are applied.
    pub fn record(
        &self,
        updates: Vec<WindowUpdate>,
        on_complete: WriteCallback,
    ) -> CheckpointResult<usize> {
        let mut state = self.state.write();
        let mut seen = HashSet::new();
        let mut admitted = Vec::with_capacity(updates.len());
        for update in updates {
            let fresh = match &update.dedup_id {
                Some(id) => seen.insert(id.clone()),
                None => true,
            };
            if fresh && state.admits(&update, &self.aggregations)? {
                admitted.push(update);
            }
        }

        let count = admitted.len();
        if admitted.is_empty() {
            drop(state);
            on_complete(Ok(()));
            return Ok(0);
        }
        self.writer.submit(admitted.clone(), on_complete)?;
        for update in &admitted {
            state.apply_update(update, &self.aggregations)?;
        }
        Ok(count)
    }

    pub fn state(&self) -> &SharedWindowState {
        &self.state
    }

    /// Counts from the playback run by `open`.
    pub fn playback_stats(&self) -> &PlaybackStats {
        &self.playback
    }

    pub fn chain(&self) -> &Arc<ChainManager> {
        self.writer.chain()
    }

    /// See [`ChainManager::request_compaction`].
    pub fn request_compaction(
        &self,
    ) -> CheckpointResult<Option<JoinHandle<CheckpointResult<LedgerId>>>> {
        self.chain().request_compaction()
    }

    /// Flush queued updates and stop the writer.
    pub fn shutdown(&self) -> CheckpointResult<()> {
        self.writer.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::mpsc;
    use uuid::Uuid;

    fn open(store: &Arc<MemoryLogStore>, coordinator: &Arc<MemoryCoordinator>) -> CheckpointLog {
        let config = CheckpointConfig {
            write_batch_timeout_ms: 5,
            segment_id_backoff_ms: 1,
            ..CheckpointConfig::default()
        };
        CheckpointLog::open(
            TaskSlot::new("job", "window", 0),
            Uuid::from_u128(7),
            Arc::clone(store) as Arc<dyn LogStore>,
            Arc::clone(coordinator) as Arc<dyn Coordinator>,
            &config,
            WindowAggregations::new().register("w", false, numeric_sum),
            Arc::new(MetricsRegistry::new()),
        )
        .unwrap()
    }

    fn record(log: &CheckpointLog, update: WindowUpdate) -> usize {
        let (tx, rx) = mpsc::channel();
        let applied = log
            .record(vec![update], Box::new(move |r| tx.send(r).unwrap()))
            .unwrap();
        rx.recv().unwrap().unwrap();
        applied
    }

    #[test]
    fn test_duplicate_update_not_written() {
        let store = Arc::new(MemoryLogStore::new());
        let coordinator = Arc::new(MemoryCoordinator::new());
        let log = open(&store, &coordinator);

        let update = WindowUpdate::new("w", 0, json!(2)).with_dedup_id("m1");
        assert_eq!(record(&log, update.clone()), 1);
        assert_eq!(record(&log, update), 0);
        log.shutdown().unwrap();

        assert_eq!(store.entries(log.chain().active_id()).len(), 1);
        assert_eq!(log.state().current().extent("w", 0, None), Some(&json!(2)));
    }

    #[test]
    fn test_record_after_shutdown_leaves_state() {
        let store = Arc::new(MemoryLogStore::new());
        let coordinator = Arc::new(MemoryCoordinator::new());
        let log = open(&store, &coordinator);
        record(&log, WindowUpdate::new("w", 0, json!(1)));
        log.shutdown().unwrap();

        let update = WindowUpdate::new("w", 0, json!(5)).with_dedup_id("late");
        let err = log.record(vec![update.clone()], Box::new(|_| {})).unwrap_err();
        assert_eq!(err.code(), CheckpointErrorCode::WriterClosed);

        let state = log.state().current();
        assert_eq!(state.extent("w", 0, None), Some(&json!(1)));
        assert!(!state.filter.contains("late"));
    }

    #[test]
    fn test_unknown_window_rejects_whole_record() {
        let store = Arc::new(MemoryLogStore::new());
        let coordinator = Arc::new(MemoryCoordinator::new());
        let log = open(&store, &coordinator);

        let updates = vec![
            WindowUpdate::new("w", 0, json!(1)),
            WindowUpdate::new("unregistered", 0, json!(1)),
        ];
        let err = log.record(updates, Box::new(|_| {})).unwrap_err();
        assert_eq!(err.code(), CheckpointErrorCode::UnknownWindow);
        assert_eq!(log.state().current().extent("w", 0, None), None);
        log.shutdown().unwrap();
    }

    #[test]
    fn test_reopen_recovers_state() {
        let store = Arc::new(MemoryLogStore::new());
        let coordinator = Arc::new(MemoryCoordinator::new());

        let first = open(&store, &coordinator);
        record(&first, WindowUpdate::new("w", 0, json!(3)));
        first.shutdown().unwrap();

        let second = open(&store, &coordinator);
        assert_eq!(second.state().current().extent("w", 0, None), Some(&json!(3)));
        assert_eq!(second.playback_stats().segments, 1);
        assert_eq!(
            coordinator.registered_chain(&TaskSlot::new("job", "window", 0)).unwrap(),
            vec![1, 2]
        );
    }
}
