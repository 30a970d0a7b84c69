//! Coordination service interface
//!
//! The coordination service is the source of truth for which segments make
//! up a task slot's chain. Writes are fire-and-forget commands whose effects
//! show up later through `registered_chain`.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::errors::CheckpointResult;
use super::store::LedgerId;
use crate::messaging::{JobId, PeerId, SlotId, TaskId};

/// The unit a chain belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskSlot {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub slot_id: SlotId,
}

impl TaskSlot {
    pub fn new(job_id: impl Into<JobId>, task_id: impl Into<TaskId>, slot_id: SlotId) -> Self {
        Self {
            job_id: job_id.into(),
            task_id: task_id.into(),
            slot_id,
        }
    }
}

impl std::fmt::Display for TaskSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.job_id, self.task_id, self.slot_id)
    }
}

/// Chain mutations requested of the coordination service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationCommand {
    /// Append `ledger_id` as the slot's new active segment
    AssignSegmentId {
        slot: TaskSlot,
        peer_id: PeerId,
        ledger_id: LedgerId,
    },
    /// Replace the chain prefix `old_prefix` with `new_suffix`
    ReplaceChainPrefix {
        slot: TaskSlot,
        peer_id: PeerId,
        old_prefix: Vec<LedgerId>,
        new_suffix: Vec<LedgerId>,
    },
}

impl CoordinationCommand {
    pub fn slot(&self) -> &TaskSlot {
        match self {
            CoordinationCommand::AssignSegmentId { slot, .. } => slot,
            CoordinationCommand::ReplaceChainPrefix { slot, .. } => slot,
        }
    }
}

pub trait Coordinator: Send + Sync {
    /// Registered segment ids, oldest first; the last one is active.
    fn registered_chain(&self, slot: &TaskSlot) -> CheckpointResult<Vec<LedgerId>>;

    /// Submit a command. Its effect becomes visible asynchronously.
    fn submit(&self, command: CoordinationCommand);
}

#[derive(Debug, Default)]
struct CoordinatorInner {
    chains: HashMap<TaskSlot, Vec<LedgerId>>,
    pending: Vec<CoordinationCommand>,
    deferred: bool,
    submitted: Vec<CoordinationCommand>,
}

impl CoordinatorInner {
    fn apply(&mut self, command: CoordinationCommand) {
        match command {
            CoordinationCommand::AssignSegmentId {
                slot, ledger_id, ..
            } => {
                let chain = self.chains.entry(slot).or_default();
                if chain.last() != Some(&ledger_id) {
                    chain.push(ledger_id);
                }
            }
            CoordinationCommand::ReplaceChainPrefix {
                slot,
                old_prefix,
                new_suffix,
                ..
            } => {
                let chain = self.chains.entry(slot.clone()).or_default();
                if chain.starts_with(&old_prefix) {
                    let rest = chain.split_off(old_prefix.len());
                    *chain = new_suffix;
                    chain.extend(rest);
                } else {
                    debug!(%slot, ?old_prefix, ?chain, "stale prefix replacement ignored");
                }
            }
        }
    }
}

/// In-process coordinator.
///
/// Applies commands on submit, or queues them until [`apply_pending`] when
/// deferred.
///
/// [`apply_pending`]: MemoryCoordinator::apply_pending
#[derive(Debug, Default)]
pub struct MemoryCoordinator {
    inner: Mutex<CoordinatorInner>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CoordinatorInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_deferred(&self, deferred: bool) {
        self.lock().deferred = deferred;
    }

    /// Apply queued commands in submission order.
    pub fn apply_pending(&self) -> usize {
        let mut inner = self.lock();
        let pending = std::mem::take(&mut inner.pending);
        let count = pending.len();
        for command in pending {
            inner.apply(command);
        }
        count
    }

    /// Drop queued commands unapplied.
    pub fn discard_pending(&self) -> usize {
        std::mem::take(&mut self.lock().pending).len()
    }

    /// Overwrite a slot's chain directly.
    pub fn set_chain(&self, slot: &TaskSlot, chain: Vec<LedgerId>) {
        self.lock().chains.insert(slot.clone(), chain);
    }

    /// Every command ever submitted, in order.
    pub fn submitted(&self) -> Vec<CoordinationCommand> {
        self.lock().submitted.clone()
    }
}

impl Coordinator for MemoryCoordinator {
    fn registered_chain(&self, slot: &TaskSlot) -> CheckpointResult<Vec<LedgerId>> {
        Ok(self.lock().chains.get(slot).cloned().unwrap_or_default())
    }

    fn submit(&self, command: CoordinationCommand) {
        let mut inner = self.lock();
        inner.submitted.push(command.clone());
        if inner.deferred {
            inner.pending.push(command);
        } else {
            inner.apply(command);
        }
    }
}
