//! Batch writer
//!
//! A single named thread drains submitted update lists into one `Batch`
//! entry per cycle and appends it to the active segment. Completion
//! callbacks run once the append is durable. Compaction transitions are
//! applied at the top of each cycle, never while a batch is being drained.
//!
//! The writer folds every batch into its own copy of the window state as it
//! takes the batch off the queue. Compaction snapshots that copy, so a
//! snapshot covers exactly the batches already handed to a segment and
//! nothing still queued.
//!
//! The inbound queue is bounded; `submit` blocks while it is full.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::chain::{ChainManager, TransitionOutcome};
use super::entry::CheckpointEntry;
use super::errors::{CheckpointError, CheckpointResult};
use super::window::{WindowAggregations, WindowState, WindowUpdate};
use crate::config::CheckpointConfig;
use crate::observability::MetricsRegistry;

/// Runs once the submitted updates are durable, or with the append error.
pub type WriteCallback = Box<dyn FnOnce(CheckpointResult<()>) + Send>;

struct WriteRequest {
    updates: Vec<WindowUpdate>,
    on_complete: WriteCallback,
}

struct WriterLoop {
    chain: Arc<ChainManager>,
    /// State as of the last batch handed to a segment
    written: WindowState,
    aggregations: WindowAggregations,
    metrics: Arc<MetricsRegistry>,
    batch_size: usize,
    batch_timeout: Duration,
}

impl WriterLoop {
    fn run(mut self, rx: mpsc::Receiver<WriteRequest>) {
        let idle_wait = self.batch_timeout.max(Duration::from_millis(1));
        loop {
            self.transition();

            let first = match rx.recv_timeout(idle_wait) {
                Ok(request) => request,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let deadline = Instant::now() + self.batch_timeout;
            let mut batch = vec![first];
            while batch.len() < self.batch_size {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match rx.try_recv() {
                    Ok(request) => batch.push(request),
                    Err(_) if remaining.is_zero() => break,
                    Err(mpsc::TryRecvError::Disconnected) => break,
                    Err(mpsc::TryRecvError::Empty) => match rx.recv_timeout(remaining) {
                        Ok(request) => batch.push(request),
                        Err(_) => break,
                    },
                }
            }
            self.write_batch(batch);
        }

        self.chain.appends().wait_all();
        info!(slot = %self.chain.slot(), "batch writer stopped");
    }

    fn transition(&self) {
        match self.chain.transition(&self.written) {
            TransitionOutcome::Idle => {}
            TransitionOutcome::Aborted { pending } => {
                debug!(pending, "compaction transition abandoned");
            }
            TransitionOutcome::Swapped {
                previous, active, ..
            } => {
                debug!(previous, active, "writer moved to new ledger");
            }
        }
    }

    fn write_batch(&mut self, batch: Vec<WriteRequest>) {
        let mut updates = Vec::new();
        let mut callbacks = Vec::with_capacity(batch.len());
        for request in batch {
            updates.extend(request.updates);
            callbacks.push(request.on_complete);
        }
        let update_count = updates.len() as u64;

        let entry = CheckpointEntry::Batch(updates);
        let bytes = match entry.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "failed to encode batch");
                for callback in callbacks {
                    callback(Err(e.clone()));
                }
                return;
            }
        };
        let byte_count = bytes.len() as u64;

        if let CheckpointEntry::Batch(updates) = &entry {
            for update in updates {
                if let Err(e) = self.written.apply_update(update, &self.aggregations) {
                    warn!(window = %update.window_id, error = %e, "update not folded into written state");
                }
            }
        }

        let active = self.chain.active();
        let ledger = active.id();
        let metrics = Arc::clone(&self.metrics);
        let appends = Arc::clone(self.chain.appends());
        appends.begin(ledger);
        self.chain.store().append(
            &active,
            bytes,
            Box::new(move |result| {
                match &result {
                    Ok(entry_id) => {
                        metrics.record_batch_written(update_count, byte_count);
                        debug!(ledger, entry_id, updates = update_count, "batch durable");
                    }
                    Err(e) => {
                        warn!(ledger, error = %e, "batch append failed");
                    }
                }
                for callback in callbacks {
                    callback(result.clone().map(|_| ()));
                }
                appends.end(ledger);
            }),
        );
    }
}

/// Handle to the writer thread of one task slot.
pub struct BatchWriter {
    sender: Mutex<Option<SyncSender<WriteRequest>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    chain: Arc<ChainManager>,
}

impl std::fmt::Debug for BatchWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWriter")
            .field("slot", self.chain.slot())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl BatchWriter {
    /// Spawn the writer thread.
    ///
    /// `written` is the state the chain replays to; submitted updates are
    /// folded into it with `aggregations` as they are batched.
    pub fn start(
        chain: Arc<ChainManager>,
        written: WindowState,
        aggregations: WindowAggregations,
        config: &CheckpointConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> CheckpointResult<Self> {
        let (tx, rx) = mpsc::sync_channel(config.write_buffer_capacity);
        let writer = WriterLoop {
            chain: Arc::clone(&chain),
            written,
            aggregations,
            metrics,
            batch_size: config.write_batch_size.max(1),
            batch_timeout: config.write_batch_timeout(),
        };
        let thread = thread::Builder::new()
            .name(format!("aeroflow-writer-{}", chain.slot().slot_id))
            .spawn(move || writer.run(rx))
            .map_err(|e| CheckpointError::io("failed to spawn batch writer", e))?;

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
            closed: AtomicBool::new(false),
            chain,
        })
    }

    /// Queue updates for the next batch.
    pub fn submit(
        &self,
        updates: Vec<WindowUpdate>,
        on_complete: WriteCallback,
    ) -> CheckpointResult<()> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(CheckpointError::writer_closed)?;
        sender
            .send(WriteRequest {
                updates,
                on_complete,
            })
            .map_err(|_| CheckpointError::writer_closed())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn chain(&self) -> &Arc<ChainManager> {
        &self.chain
    }

    /// Drain queued updates, wait for outstanding appends and stop the
    /// thread. Idempotent.
    pub fn shutdown(&self) -> CheckpointResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.chain.shutdown();
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let thread = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(thread) = thread {
            thread
                .join()
                .map_err(|_| CheckpointError::shutdown("batch writer thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for BatchWriter {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(error = %e, "batch writer shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::coordination::{Coordinator, MemoryCoordinator, TaskSlot};
    use crate::checkpoint::store::{LogStore, MemoryLogStore};
    use crate::checkpoint::window::numeric_sum;
    use crate::checkpoint::CheckpointErrorCode;
    use serde_json::json;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<MemoryLogStore>,
        metrics: Arc<MetricsRegistry>,
        writer: BatchWriter,
    }

    fn fixture(batch_size: usize, timeout_ms: u64) -> Fixture {
        let config = CheckpointConfig {
            write_batch_size: batch_size,
            write_batch_timeout_ms: timeout_ms,
            segment_id_backoff_ms: 1,
            ..CheckpointConfig::default()
        };
        let store = Arc::new(MemoryLogStore::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let chain = ChainManager::start(
            TaskSlot::new("job", "window", 0),
            Uuid::from_u128(1),
            Arc::clone(&store) as Arc<dyn LogStore>,
            Arc::new(MemoryCoordinator::new()) as Arc<dyn Coordinator>,
            &config,
            Arc::clone(&metrics),
        )
        .unwrap();
        let writer = BatchWriter::start(
            Arc::new(chain),
            WindowState::new(),
            WindowAggregations::new().register("w", false, numeric_sum),
            &config,
            Arc::clone(&metrics),
        )
        .unwrap();
        Fixture {
            store,
            metrics,
            writer,
        }
    }

    fn update(value: i64) -> Vec<WindowUpdate> {
        vec![WindowUpdate::new("w", 0, json!(value))]
    }

    fn submit(writer: &BatchWriter, value: i64) -> mpsc::Receiver<CheckpointResult<()>> {
        let (tx, rx) = mpsc::channel();
        writer
            .submit(update(value), Box::new(move |r| tx.send(r).unwrap()))
            .unwrap();
        rx
    }

    fn wait_until(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn decode_batches(store: &MemoryLogStore, ledger: u64) -> Vec<Vec<WindowUpdate>> {
        store
            .entries(ledger)
            .iter()
            .map(|bytes| match CheckpointEntry::decode(bytes).unwrap() {
                CheckpointEntry::Batch(updates) => updates,
                other => panic!("unexpected entry {}", other.kind()),
            })
            .collect()
    }

    #[test]
    fn test_submissions_coalesce_into_one_entry() {
        let f = fixture(3, 500);
        let receivers: Vec<_> = (1..=3).map(|v| submit(&f.writer, v)).collect();
        for rx in receivers {
            rx.recv().unwrap().unwrap();
        }

        let batches = decode_batches(&f.store, 1);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[0][2].value, json!(3));
        assert_eq!(f.metrics.snapshot().batches_written, 1);
        assert_eq!(f.metrics.snapshot().updates_written, 3);
    }

    #[test]
    fn test_callback_waits_for_durability() {
        let f = fixture(1, 5);
        f.store.hold_appends(true);

        let rx = submit(&f.writer, 1);
        wait_until(|| f.store.held_appends() == 1);
        assert!(rx.try_recv().is_err());

        f.store.release_appends();
        rx.recv().unwrap().unwrap();
        assert_eq!(f.store.entries(1).len(), 1);
    }

    #[test]
    fn test_append_failure_reaches_callbacks() {
        let f = fixture(1, 5);
        f.store.fail_appends(true);

        let err = submit(&f.writer, 1).recv().unwrap().unwrap_err();
        assert_eq!(err.code(), CheckpointErrorCode::LogStoreFailed);
        assert_eq!(f.metrics.snapshot().batches_written, 0);
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let f = fixture(2, 5);
        let receivers: Vec<_> = (0..5).map(|v| submit(&f.writer, v)).collect();

        f.writer.shutdown().unwrap();
        f.writer.shutdown().unwrap();

        for rx in receivers {
            rx.try_recv().unwrap().unwrap();
        }
        let written: usize = decode_batches(&f.store, 1).iter().map(Vec::len).sum();
        assert_eq!(written, 5);

        let err = f.writer.submit(update(9), Box::new(|_| {})).unwrap_err();
        assert_eq!(err.code(), CheckpointErrorCode::WriterClosed);
    }

    #[test]
    fn test_writes_follow_compaction_transition() {
        let f = fixture(1, 5);
        submit(&f.writer, 1).recv().unwrap().unwrap();

        let chain = Arc::clone(f.writer.chain());
        chain.request_compaction().unwrap().unwrap().join().unwrap().unwrap();
        wait_until(|| chain.active_id() == 2);

        submit(&f.writer, 2).recv().unwrap().unwrap();
        assert_eq!(decode_batches(&f.store, 1).len(), 1);
        assert_eq!(decode_batches(&f.store, 2).len(), 1);
    }

    #[test]
    fn test_snapshot_excludes_queued_updates() {
        let f = fixture(1, 5);
        f.store.hold_appends(true);
        let first = submit(&f.writer, 1);
        wait_until(|| f.store.held_appends() == 1);

        let chain = Arc::clone(f.writer.chain());
        chain.request_compaction().unwrap().unwrap().join().unwrap().unwrap();
        let second = submit(&f.writer, 10);
        // batch 1, batch 2 and the snapshot
        wait_until(|| f.store.held_appends() == 3);

        f.store.hold_appends(false);
        f.store.release_appends();
        first.recv().unwrap().unwrap();
        second.recv().unwrap().unwrap();
        wait_until(|| f.metrics.snapshot().compactions_completed == 1);

        let snapshot = f
            .store
            .ledger_ids()
            .into_iter()
            .find_map(|id| match f.store.entries(id).first() {
                Some(bytes) => match CheckpointEntry::decode(bytes).unwrap() {
                    CheckpointEntry::Compacted(state) => Some(state),
                    CheckpointEntry::Batch(_) => None,
                },
                None => None,
            })
            .unwrap();
        let written: i64 = decode_batches(&f.store, 2)
            .iter()
            .flatten()
            .map(|u| u.value.as_i64().unwrap())
            .sum();
        let snapshotted = snapshot.extents[0].value.as_i64().unwrap();
        assert_eq!(snapshotted + written, 11);
    }

    #[test]
    fn test_in_flight_batch_survives_swap() {
        let f = fixture(1, 5);
        f.store.hold_appends(true);
        let rx = submit(&f.writer, 1);
        wait_until(|| f.store.held_appends() == 1);

        let chain = Arc::clone(f.writer.chain());
        chain.request_compaction().unwrap().unwrap().join().unwrap().unwrap();
        wait_until(|| chain.active_id() == 2);
        assert!(!f.store.is_sealed(1));

        f.store.hold_appends(false);
        f.store.release_appends();
        rx.recv().unwrap().unwrap();
        assert_eq!(decode_batches(&f.store, 1).len(), 1);
        wait_until(|| f.store.is_sealed(1));
    }
}
