//! Ledger chain manager
//!
//! Tracks the active segment of one task slot and at most one pending
//! segment prepared by a compaction request.
//!
//! # Compaction
//!
//! 1. `request_compaction` (background): create a segment, ask the
//!    coordinator to append it to the chain, wait until the registered
//!    chain ends with it, mark it pending.
//! 2. `transition` (writer thread, between batches): if the registered
//!    chain still ends with the pending segment, make it active, write a
//!    `Compacted` snapshot to a fresh segment and, once that is durable,
//!    ask the coordinator to replace the chain prefix up to the previous
//!    segment with the snapshot segment. The previous segment is closed in
//!    the background once every append issued against it has completed.
//!
//! The snapshot source must reflect exactly the batches handed to the
//! previous segment, no more.
//!
//! If the registered chain does not end with the pending segment the
//! transition is abandoned: the active segment is unchanged and stays open.
//! A lost prefix replacement leaves the old prefix in place, which replays
//! to the same state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use super::coordination::{CoordinationCommand, Coordinator, TaskSlot};
use super::entry::CheckpointEntry;
use super::errors::{CheckpointError, CheckpointResult};
use super::store::{LedgerHandle, LedgerId, LedgerOptions, LogStore};
use super::window::StateSnapshotSource;
use crate::config::CheckpointConfig;
use crate::messaging::PeerId;
use crate::observability::MetricsRegistry;

/// Everything needed to create and register segments for one slot.
#[derive(Clone)]
struct Registrar {
    slot: TaskSlot,
    peer_id: PeerId,
    store: Arc<dyn LogStore>,
    coordinator: Arc<dyn Coordinator>,
    options: LedgerOptions,
    backoff: Duration,
    max_retries: u32,
    shutdown: Arc<AtomicBool>,
}

impl Registrar {
    /// Create a segment and wait until it is the newest registered one.
    fn create_registered(&self) -> CheckpointResult<LedgerHandle> {
        let handle = self.store.create(&self.options)?;
        self.coordinator
            .submit(CoordinationCommand::AssignSegmentId {
                slot: self.slot.clone(),
                peer_id: self.peer_id,
                ledger_id: handle.id(),
            });

        if let Err(e) = self.await_registration(handle.id()) {
            if let Err(close_err) = self.store.close(&handle) {
                debug!(ledger = handle.id(), error = %close_err, "failed to close unregistered ledger");
            }
            return Err(e);
        }
        Ok(handle)
    }

    fn await_registration(&self, ledger_id: LedgerId) -> CheckpointResult<()> {
        let mut rng = rand::thread_rng();
        for attempt in 0..self.max_retries {
            if self.shutdown.load(Ordering::Acquire) {
                return Err(CheckpointError::shutdown(format!(
                    "shutdown while waiting for ledger {} registration",
                    ledger_id
                )));
            }
            let chain = self.coordinator.registered_chain(&self.slot)?;
            if chain.last() == Some(&ledger_id) {
                debug!(slot = %self.slot, ledger = ledger_id, attempt, "ledger registered");
                return Ok(());
            }
            let base = self.backoff.as_millis() as u64;
            let jitter = rng.gen_range(0..=base / 2);
            thread::sleep(Duration::from_millis(base + jitter));
        }
        Err(CheckpointError::registration_timeout(
            ledger_id,
            self.max_retries,
        ))
    }
}

/// Appends issued but not yet acknowledged, per ledger.
#[derive(Debug, Default)]
pub(crate) struct AppendTracker {
    outstanding: Mutex<HashMap<LedgerId, usize>>,
    drained: Condvar,
}

impl AppendTracker {
    pub(crate) fn begin(&self, ledger: LedgerId) {
        *lock(&self.outstanding).entry(ledger).or_insert(0) += 1;
    }

    pub(crate) fn end(&self, ledger: LedgerId) {
        let mut outstanding = lock(&self.outstanding);
        if let Some(count) = outstanding.get_mut(&ledger) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                outstanding.remove(&ledger);
            }
        }
        self.drained.notify_all();
    }

    pub(crate) fn outstanding(&self, ledger: LedgerId) -> usize {
        lock(&self.outstanding).get(&ledger).copied().unwrap_or(0)
    }

    /// Block until no append against `ledger` is outstanding.
    pub(crate) fn wait_drained(&self, ledger: LedgerId) {
        let mut outstanding = lock(&self.outstanding);
        while outstanding.contains_key(&ledger) {
            outstanding = self
                .drained
                .wait(outstanding)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Block until no append is outstanding on any ledger.
    pub(crate) fn wait_all(&self) {
        let mut outstanding = lock(&self.outstanding);
        while !outstanding.is_empty() {
            outstanding = self
                .drained
                .wait(outstanding)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Result of a transition attempt.
#[derive(Debug)]
pub enum TransitionOutcome {
    /// No pending segment
    Idle,
    /// Registered chain did not end with the pending segment
    Aborted { pending: LedgerId },
    /// Pending segment is now active
    Swapped {
        previous: LedgerId,
        active: LedgerId,
        /// Background close of the previous segment, after its appends drain
        closing: Option<JoinHandle<()>>,
        /// Id of the durable snapshot segment, or why none was written
        compacted: mpsc::Receiver<CheckpointResult<LedgerId>>,
    },
}

/// Active/pending segment pointers of one task slot.
pub struct ChainManager {
    registrar: Registrar,
    metrics: Arc<MetricsRegistry>,
    active: Mutex<LedgerHandle>,
    pending: Arc<Mutex<Option<LedgerHandle>>>,
    compaction_in_flight: Arc<AtomicBool>,
    appends: Arc<AppendTracker>,
}

impl std::fmt::Debug for ChainManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainManager")
            .field("slot", &self.registrar.slot)
            .field("active", &self.active_id())
            .field("pending", &self.pending_id())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ChainManager {
    /// Create and register the initial active segment.
    pub fn start(
        slot: TaskSlot,
        peer_id: PeerId,
        store: Arc<dyn LogStore>,
        coordinator: Arc<dyn Coordinator>,
        config: &CheckpointConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> CheckpointResult<Self> {
        let registrar = Registrar {
            slot,
            peer_id,
            store,
            coordinator,
            options: config.ledger_options(),
            backoff: config.segment_id_backoff(),
            max_retries: config.segment_id_max_retries,
            shutdown: Arc::new(AtomicBool::new(false)),
        };
        let active = registrar.create_registered()?;
        info!(slot = %registrar.slot, ledger = active.id(), "active ledger registered");

        Ok(Self {
            registrar,
            metrics,
            active: Mutex::new(active),
            pending: Arc::new(Mutex::new(None)),
            compaction_in_flight: Arc::new(AtomicBool::new(false)),
            appends: Arc::new(AppendTracker::default()),
        })
    }

    pub fn slot(&self) -> &TaskSlot {
        &self.registrar.slot
    }

    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.registrar.store
    }

    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.registrar.coordinator
    }

    pub fn active(&self) -> LedgerHandle {
        lock(&self.active).clone()
    }

    pub fn active_id(&self) -> LedgerId {
        lock(&self.active).id()
    }

    pub fn pending_id(&self) -> Option<LedgerId> {
        lock(&self.pending).as_ref().map(LedgerHandle::id)
    }

    /// Writers register every append here so a swapped-out segment is only
    /// closed once drained.
    pub(crate) fn appends(&self) -> &Arc<AppendTracker> {
        &self.appends
    }

    pub fn is_compaction_in_flight(&self) -> bool {
        self.compaction_in_flight.load(Ordering::Acquire)
    }

    /// Prepare the next segment in the background.
    ///
    /// Returns `None` if a request is already in flight or a segment is
    /// already pending. The handle yields the registered segment id.
    pub fn request_compaction(
        &self,
    ) -> CheckpointResult<Option<JoinHandle<CheckpointResult<LedgerId>>>> {
        if self.pending_id().is_some() || self.compaction_in_flight.swap(true, Ordering::AcqRel) {
            return Ok(None);
        }

        let registrar = self.registrar.clone();
        let pending = Arc::clone(&self.pending);
        let in_flight = Arc::clone(&self.compaction_in_flight);
        let spawned = thread::Builder::new()
            .name(format!("aeroflow-compaction-{}", registrar.slot.slot_id))
            .spawn(move || {
                let result = registrar.create_registered();
                let outcome = match result {
                    Ok(handle) => {
                        let id = handle.id();
                        *lock(&pending) = Some(handle);
                        info!(slot = %registrar.slot, ledger = id, "compaction ledger pending");
                        Ok(id)
                    }
                    Err(e) => {
                        warn!(slot = %registrar.slot, error = %e, "compaction ledger not prepared");
                        Err(e)
                    }
                };
                in_flight.store(false, Ordering::Release);
                outcome
            });

        match spawned {
            Ok(handle) => Ok(Some(handle)),
            Err(e) => {
                self.compaction_in_flight.store(false, Ordering::Release);
                Err(CheckpointError::io("failed to spawn compaction thread", e))
            }
        }
    }

    /// Swap in the pending segment and compact. Call only from the writer
    /// thread, between batches.
    pub fn transition(&self, source: &dyn StateSnapshotSource) -> TransitionOutcome {
        let Some(pending) = lock(&self.pending).take() else {
            return TransitionOutcome::Idle;
        };
        let slot = &self.registrar.slot;

        let chain = match self.registrar.coordinator.registered_chain(slot) {
            Ok(chain) => chain,
            Err(e) => {
                warn!(%slot, ledger = pending.id(), error = %e, "could not read chain, compaction abandoned");
                self.abandon(&pending);
                return TransitionOutcome::Aborted {
                    pending: pending.id(),
                };
            }
        };
        if chain.last() != Some(&pending.id()) {
            warn!(
                %slot,
                pending = pending.id(),
                ?chain,
                "registered chain does not end with pending ledger, compaction abandoned"
            );
            self.abandon(&pending);
            return TransitionOutcome::Aborted {
                pending: pending.id(),
            };
        }

        let previous = std::mem::replace(&mut *lock(&self.active), pending.clone());
        let old_prefix = chain[..chain.len() - 1].to_vec();
        info!(%slot, previous = previous.id(), active = pending.id(), "active ledger swapped");

        let closing = self.close_in_background(previous.clone());
        let compacted = self.write_compacted(source, old_prefix);

        TransitionOutcome::Swapped {
            previous: previous.id(),
            active: pending.id(),
            closing,
            compacted,
        }
    }

    fn abandon(&self, pending: &LedgerHandle) {
        self.metrics.increment_compactions_aborted();
        if let Err(e) = self.registrar.store.close(pending) {
            debug!(ledger = pending.id(), error = %e, "failed to close abandoned ledger");
        }
    }

    fn close_in_background(&self, handle: LedgerHandle) -> Option<JoinHandle<()>> {
        let store = Arc::clone(&self.registrar.store);
        let appends = Arc::clone(&self.appends);
        let id = handle.id();
        let spawned = thread::Builder::new()
            .name(format!("aeroflow-ledger-close-{}", id))
            .spawn(move || {
                let outstanding = appends.outstanding(id);
                if outstanding > 0 {
                    debug!(ledger = id, outstanding, "waiting for appends before close");
                }
                appends.wait_drained(id);
                if let Err(e) = store.close(&handle) {
                    warn!(ledger = handle.id(), error = %e, "failed to close previous ledger");
                }
            });
        match spawned {
            Ok(join) => Some(join),
            Err(e) => {
                warn!(ledger = id, error = %e, "failed to spawn close thread, closing inline");
                self.appends.wait_drained(id);
                if let Err(e) = self.registrar.store.close(&LedgerHandle::new(id)) {
                    warn!(ledger = id, error = %e, "failed to close previous ledger");
                }
                None
            }
        }
    }

    /// Write a snapshot segment; on durability replace `old_prefix` with it.
    fn write_compacted(
        &self,
        source: &dyn StateSnapshotSource,
        old_prefix: Vec<LedgerId>,
    ) -> mpsc::Receiver<CheckpointResult<LedgerId>> {
        let (tx, rx) = mpsc::channel();
        let snapshot = source.snapshot();
        let extents = snapshot.extents.len();

        let prepared = CheckpointEntry::Compacted(snapshot)
            .encode()
            .and_then(|bytes| Ok((self.registrar.store.create(&self.registrar.options)?, bytes)));
        let (handle, bytes) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(slot = %self.registrar.slot, error = %e, "compaction snapshot not written");
                let _ = tx.send(Err(e));
                return rx;
            }
        };

        let registrar = self.registrar.clone();
        let metrics = Arc::clone(&self.metrics);
        let compacted = handle.clone();
        self.registrar.store.append(
            &handle,
            bytes,
            Box::new(move |result| {
                let outcome = match result {
                    Ok(_) => {
                        registrar
                            .coordinator
                            .submit(CoordinationCommand::ReplaceChainPrefix {
                                slot: registrar.slot.clone(),
                                peer_id: registrar.peer_id,
                                old_prefix: old_prefix.clone(),
                                new_suffix: vec![compacted.id()],
                            });
                        if let Err(e) = registrar.store.close(&compacted) {
                            debug!(ledger = compacted.id(), error = %e, "failed to close compacted ledger");
                        }
                        metrics.increment_compactions_completed();
                        info!(
                            slot = %registrar.slot,
                            ledger = compacted.id(),
                            extents,
                            replaced = ?old_prefix,
                            "compacted snapshot durable"
                        );
                        Ok(compacted.id())
                    }
                    Err(e) => {
                        warn!(slot = %registrar.slot, ledger = compacted.id(), error = %e, "compacted snapshot append failed");
                        Err(e)
                    }
                };
                let _ = tx.send(outcome);
            }),
        );
        rx
    }

    /// Stop waiting for segment registration.
    pub fn shutdown(&self) {
        self.registrar.shutdown.store(true, Ordering::Release);
    }
}
