//! Recovery / steady-state handler
//!
//! One handler per subscription, mutated only by the thread running that
//! subscription's poll cycle. It classifies every delivered fragment,
//! performs the recovery handshake, assembles the deduplicated message
//! batch for the cycle and detects barrier alignment and completion.
//!
//! ```text
//! AwaitingRecovery ──handshake──▶ Ready ──barrier──▶ SteadyBlocked ⇄ SteadyAccepting
//!        │                                              ▲     │
//!        └──────────addressed epoch-1 barrier───────────┘     └─completed barrier─▶ Completed
//! ```
//!
//! Within one cycle a barrier is only processed while the batch is empty,
//! so messages and barriers never share a cycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::errors::{MessagingError, MessagingResult};
use super::frame::{Epoch, Frame, FrameBody, ReplicaVersion, SessionId, SubscriptionKey};
use super::ticket::{Ticket, TicketRegistry};
use super::transport::{Delivery, PollAction};

/// Handler states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// No session negotiated for the current replica version
    AwaitingRecovery,
    /// Session negotiated, no barrier aligned yet
    Ready,
    /// Accepting messages for the current epoch
    SteadyAccepting,
    /// A barrier is aligned; intake paused until the epoch is advanced
    SteadyBlocked,
    /// A completing barrier is aligned; terminal
    Completed,
}

/// Result of one poll cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Newly accepted payloads, in transport order
    pub batch: Vec<Vec<u8>>,
    /// Intake is paused at a barrier (also true once completed)
    pub blocked: bool,
    pub completed: bool,
    /// Barrier aligned during this cycle
    pub aligned_epoch: Option<Epoch>,
    /// Redelivered messages dropped during this cycle
    pub duplicates: u64,
}

/// Per-subscription protocol state machine.
#[derive(Debug)]
pub struct Handler {
    key: SubscriptionKey,
    tickets: Arc<TicketRegistry>,
    max_messages_per_poll: usize,

    state: HandlerState,
    replica_version: ReplicaVersion,
    /// Last aligned epoch; 0 before the first barrier of a version
    epoch: Epoch,
    session_id: Option<SessionId>,
    ticket: Option<Arc<Ticket>>,
    recovery: Option<serde_json::Value>,
    /// Millisecond timestamp of the last sign of life, read cross-thread
    heartbeat: Arc<AtomicU64>,
    /// Sticky once set; the subscription must be recreated
    violation: Option<MessagingError>,

    batch: Vec<Vec<u8>>,
    aligned_epoch: Option<Epoch>,
    duplicates: u64,
}

impl Handler {
    pub fn new(
        key: SubscriptionKey,
        replica_version: ReplicaVersion,
        tickets: Arc<TicketRegistry>,
        max_messages_per_poll: usize,
        now_ms: u64,
    ) -> Self {
        Self {
            key,
            tickets,
            max_messages_per_poll: max_messages_per_poll.max(1),
            state: HandlerState::AwaitingRecovery,
            replica_version,
            epoch: 0,
            session_id: None,
            ticket: None,
            recovery: None,
            heartbeat: Arc::new(AtomicU64::new(now_ms)),
            violation: None,
            batch: Vec::new(),
            aligned_epoch: None,
            duplicates: 0,
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn replica_version(&self) -> ReplicaVersion {
        self.replica_version
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    /// Recovery coordinates from the first barrier of this version, if any.
    pub fn recovery_info(&self) -> Option<&serde_json::Value> {
        self.recovery.as_ref()
    }

    pub fn last_heartbeat_ms(&self) -> u64 {
        self.heartbeat.load(Ordering::Acquire)
    }

    /// Shared heartbeat cell for liveness checks from other threads.
    pub fn heartbeat_cell(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.heartbeat)
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self.state, HandlerState::SteadyBlocked | HandlerState::Completed)
    }

    pub fn is_completed(&self) -> bool {
        self.state == HandlerState::Completed
    }

    pub fn violation(&self) -> Option<&MessagingError> {
        self.violation.as_ref()
    }

    /// Move to a new topology generation.
    ///
    /// Session, ticket, recovery info and epoch belong to the old
    /// generation; a new handshake is required.
    pub fn set_replica_version(&mut self, replica_version: ReplicaVersion, now_ms: u64) {
        debug!(
            src_peer = %self.key.src_peer_id,
            task = %self.key.dst_task_id,
            slot = self.key.slot_id,
            from = self.replica_version,
            to = replica_version,
            "replica version changed, awaiting recovery"
        );
        self.replica_version = replica_version;
        self.epoch = 0;
        self.session_id = None;
        self.ticket = None;
        self.recovery = None;
        self.state = HandlerState::AwaitingRecovery;
        self.refresh_heartbeat(now_ms);
    }

    /// Overwrite the epoch expectation. State is unchanged.
    pub fn set_epoch(&mut self, epoch: Epoch) {
        self.epoch = epoch;
    }

    /// Release a barrier-blocked handler into the next epoch.
    ///
    /// No effect in any other state; `Completed` is terminal.
    pub fn unblock(&mut self) {
        if self.state == HandlerState::SteadyBlocked {
            self.state = HandlerState::SteadyAccepting;
        }
    }

    /// Reset per-cycle accumulators.
    pub fn begin_cycle(&mut self) {
        self.batch.clear();
        self.aligned_epoch = None;
        self.duplicates = 0;
    }

    /// Collect the cycle's batch, or the protocol violation that ended it.
    pub fn finish_cycle(&mut self) -> MessagingResult<PollOutcome> {
        if let Some(violation) = &self.violation {
            self.batch.clear();
            return Err(violation.clone());
        }
        Ok(PollOutcome {
            batch: std::mem::take(&mut self.batch),
            blocked: self.is_blocked(),
            completed: self.is_completed(),
            aligned_epoch: self.aligned_epoch.take(),
            duplicates: std::mem::take(&mut self.duplicates),
        })
    }

    /// Poll callback: classify one delivered fragment.
    pub fn on_delivery(&mut self, delivery: &Delivery, now_ms: u64) -> PollAction {
        if self.violation.is_some() || self.is_blocked() {
            return PollAction::Abort;
        }

        let frame = match Frame::decode(&delivery.bytes) {
            Ok(frame) => frame,
            Err(e) => return self.fail(e),
        };

        match self.state {
            HandlerState::AwaitingRecovery => self.on_recovery_frame(delivery, frame, now_ms),
            HandlerState::Ready | HandlerState::SteadyAccepting => {
                self.on_steady_frame(delivery, frame, now_ms)
            }
            HandlerState::SteadyBlocked | HandlerState::Completed => PollAction::Abort,
        }
    }

    fn on_recovery_frame(&mut self, delivery: &Delivery, frame: Frame, now_ms: u64) -> PollAction {
        let version = frame.header.replica_version;
        if version < self.replica_version {
            return PollAction::Continue;
        }
        if version > self.replica_version {
            // Not caught up with the sender yet; retry next cycle.
            return PollAction::Abort;
        }

        match frame.body {
            FrameBody::ReadyHandshake => {
                self.adopt_session(delivery.session_id);
                self.refresh_heartbeat(now_ms);
                self.state = HandlerState::Ready;
                debug!(
                    src_peer = %self.key.src_peer_id,
                    task = %self.key.dst_task_id,
                    slot = self.key.slot_id,
                    session = delivery.session_id,
                    replica_version = self.replica_version,
                    "handshake received"
                );
                PollAction::Continue
            }
            FrameBody::Heartbeat => {
                self.refresh_heartbeat(now_ms);
                PollAction::Continue
            }
            FrameBody::Barrier { epoch: 1, .. } if !frame.header.is_addressed_to(&self.key) => {
                PollAction::Continue
            }
            FrameBody::Barrier {
                epoch: 1,
                completed,
                recovery,
            } => {
                if self.session_id.is_none() {
                    self.adopt_session(delivery.session_id);
                }
                self.recovery = recovery;
                self.align(1, completed, now_ms);
                PollAction::Break
            }
            other => self.fail(MessagingError::protocol_violation(format!(
                "unexpected {} frame while awaiting recovery",
                other.name()
            ))),
        }
    }

    fn on_steady_frame(&mut self, delivery: &Delivery, frame: Frame, now_ms: u64) -> PollAction {
        if !frame.header.is_addressed_to(&self.key) {
            return PollAction::Continue;
        }
        let version = frame.header.replica_version;
        if version < self.replica_version {
            return PollAction::Continue;
        }
        if version > self.replica_version {
            return self.fail(MessagingError::replica_version_ahead(
                self.replica_version,
                version,
            ));
        }

        match frame.body {
            FrameBody::Heartbeat => {
                self.refresh_heartbeat(now_ms);
                PollAction::Continue
            }
            FrameBody::ReadyHandshake => {
                if self.session_id == Some(delivery.session_id) {
                    PollAction::Continue
                } else {
                    self.fail(self.foreign_session(delivery.session_id, "handshake"))
                }
            }
            FrameBody::Message { payload } => {
                if self.batch.len() >= self.max_messages_per_poll {
                    return PollAction::Abort;
                }
                if self.session_id != Some(delivery.session_id) {
                    return self.fail(self.foreign_session(delivery.session_id, "message"));
                }
                let accepted = match &self.ticket {
                    Some(ticket) => ticket.try_accept(delivery.position),
                    None => {
                        return self.fail(MessagingError::protocol_violation(
                            "message received before a session ticket was derived",
                        ))
                    }
                };
                if accepted {
                    self.batch.push(payload);
                    self.refresh_heartbeat(now_ms);
                } else {
                    self.duplicates += 1;
                }
                PollAction::Continue
            }
            FrameBody::Barrier {
                epoch,
                completed,
                recovery,
            } => {
                if !self.batch.is_empty() {
                    return PollAction::Abort;
                }
                let expected = self.epoch + 1;
                if epoch != expected {
                    return self.fail(MessagingError::unexpected_epoch(expected, epoch));
                }
                if recovery.is_some() {
                    self.recovery = recovery;
                }
                self.align(epoch, completed, now_ms);
                PollAction::Break
            }
            other => self.fail(MessagingError::protocol_violation(format!(
                "{} frame on a data stream",
                other.name()
            ))),
        }
    }

    fn align(&mut self, epoch: Epoch, completed: bool, now_ms: u64) {
        self.epoch = epoch;
        self.aligned_epoch = Some(epoch);
        self.state = if completed {
            HandlerState::Completed
        } else {
            HandlerState::SteadyBlocked
        };
        self.refresh_heartbeat(now_ms);
        debug!(
            src_peer = %self.key.src_peer_id,
            task = %self.key.dst_task_id,
            slot = self.key.slot_id,
            replica_version = self.replica_version,
            epoch,
            completed,
            "barrier aligned"
        );
    }

    fn adopt_session(&mut self, session_id: SessionId) {
        self.session_id = Some(session_id);
        self.ticket = Some(self.tickets.resolve(self.key.src_peer_id, session_id));
    }

    fn foreign_session(&self, session_id: SessionId, what: &str) -> MessagingError {
        MessagingError::protocol_violation(format!(
            "{} on session {} outside negotiated session {:?}",
            what, session_id, self.session_id
        ))
    }

    fn refresh_heartbeat(&self, now_ms: u64) {
        self.heartbeat.fetch_max(now_ms, Ordering::AcqRel);
    }

    fn fail(&mut self, error: MessagingError) -> PollAction {
        warn!(
            src_peer = %self.key.src_peer_id,
            task = %self.key.dst_task_id,
            slot = self.key.slot_id,
            replica_version = self.replica_version,
            epoch = self.epoch,
            error = %error,
            "protocol violation"
        );
        self.violation = Some(error);
        PollAction::Abort
    }
}
