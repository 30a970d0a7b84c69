//! Subscriber lifecycle and liveness
//!
//! A subscriber owns one data-stream subscription, the status-stream
//! publication it answers on, and the handler that interprets frames. Poll
//! cycles are driven by an external scheduler; liveness may be read from
//! any thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::channel::ChannelAddress;
use super::errors::{MessagingError, MessagingResult};
use super::frame::{
    Epoch, Frame, FrameBody, FrameHeader, JobId, ReplicaVersion, SessionId, SubscriptionKey,
};
use super::handler::{Handler, HandlerState, PollOutcome};
use super::ticket::TicketRegistry;
use super::transport::{Delivery, Publication, Subscription, Transport};
use crate::config::MessagingConfig;
use crate::observability::MetricsRegistry;

/// Millisecond wall clock.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Everything needed to (re)create a subscriber for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberDescriptor {
    pub key: SubscriptionKey,
    pub job_id: JobId,
    /// Site of the upstream publisher, where status frames are sent
    pub status_site: String,
    pub replica_version: ReplicaVersion,
}

impl SubscriberDescriptor {
    pub fn data_address(&self) -> ChannelAddress {
        ChannelAddress::data(
            &self.job_id,
            &self.key.dst_task_id,
            self.key.slot_id,
            &self.key.site,
        )
    }

    pub fn status_address(&self) -> ChannelAddress {
        ChannelAddress::status(
            &self.job_id,
            &self.key.dst_task_id,
            self.key.slot_id,
            &self.status_site,
        )
    }
}

/// A single subscription and its protocol state.
pub struct Subscriber {
    descriptor: SubscriberDescriptor,
    handler: Handler,
    heartbeat: Arc<AtomicU64>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRegistry>,
    liveness_timeout: Duration,
    poll_fragment_limit: usize,
    subscription: Option<Box<dyn Subscription>>,
    status: Option<Box<dyn Publication>>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("descriptor", &self.descriptor)
            .field("state", &self.handler.state())
            .field("started", &self.is_started())
            .finish()
    }
}

impl Subscriber {
    pub fn new(
        descriptor: SubscriberDescriptor,
        transport: Arc<dyn Transport>,
        tickets: Arc<TicketRegistry>,
        config: &MessagingConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        let handler = Handler::new(
            descriptor.key.clone(),
            descriptor.replica_version,
            tickets,
            config.max_messages_per_poll,
            clock.now_ms(),
        );
        let heartbeat = handler.heartbeat_cell();
        Self {
            descriptor,
            handler,
            heartbeat,
            transport,
            clock,
            metrics,
            liveness_timeout: config.liveness_timeout(),
            poll_fragment_limit: config.poll_fragment_limit,
            subscription: None,
            status: None,
        }
    }

    /// Open the data subscription and the status publication.
    ///
    /// Starting an already started subscriber is a no-op.
    pub fn start(&mut self) -> MessagingResult<()> {
        if self.is_started() {
            return Ok(());
        }

        let data = self.descriptor.data_address();
        let status = self.descriptor.status_address();
        let subscription = self.transport.subscribe(&data)?;
        let publication = match self.transport.publish(&status) {
            Ok(publication) => publication,
            Err(e) => {
                let mut subscription = subscription;
                subscription.close();
                return Err(e);
            }
        };

        self.subscription = Some(subscription);
        self.status = Some(publication);
        self.heartbeat.fetch_max(self.clock.now_ms(), Ordering::AcqRel);

        info!(
            src_peer = %self.descriptor.key.src_peer_id,
            task = %self.descriptor.key.dst_task_id,
            slot = self.descriptor.key.slot_id,
            channel = %data.channel,
            stream_id = data.stream_id,
            replica_version = self.descriptor.replica_version,
            "subscriber started"
        );
        Ok(())
    }

    /// Close transport resources. Idempotent.
    pub fn stop(&mut self) {
        let had_subscription = self.subscription.is_some();
        if let Some(mut subscription) = self.subscription.take() {
            subscription.close();
        }
        if let Some(mut status) = self.status.take() {
            status.close();
        }
        if had_subscription {
            info!(
                src_peer = %self.descriptor.key.src_peer_id,
                task = %self.descriptor.key.dst_task_id,
                slot = self.descriptor.key.slot_id,
                "subscriber stopped"
            );
        }
    }

    pub fn is_started(&self) -> bool {
        self.subscription.is_some()
    }

    /// Connected and heard from within the liveness timeout.
    pub fn is_alive(&self) -> bool {
        let connected = self
            .subscription
            .as_ref()
            .map(|s| s.is_connected())
            .unwrap_or(false);
        let silent_for = self
            .clock
            .now_ms()
            .saturating_sub(self.heartbeat.load(Ordering::Acquire));
        connected && u128::from(silent_for) < self.liveness_timeout.as_millis()
    }

    /// Run one poll cycle.
    ///
    /// A blocked or completed subscriber does not touch the transport.
    pub fn poll(&mut self) -> MessagingResult<PollOutcome> {
        if let Some(violation) = self.handler.violation() {
            return Err(violation.clone());
        }
        let now_ms = self.clock.now_ms();
        let limit = self.poll_fragment_limit;
        let handler = &mut self.handler;
        let subscription = self
            .subscription
            .as_mut()
            .ok_or_else(|| MessagingError::not_started("poll on a stopped subscriber"))?;

        handler.begin_cycle();
        if !handler.is_blocked() {
            subscription.poll(
                &mut |delivery: &Delivery| handler.on_delivery(delivery, now_ms),
                limit,
            );
        }

        match handler.finish_cycle() {
            Ok(outcome) => {
                self.metrics.add_messages_accepted(outcome.batch.len() as u64);
                self.metrics.add_duplicates_dropped(outcome.duplicates);
                if outcome.aligned_epoch.is_some() {
                    self.metrics.increment_barriers_aligned();
                }
                Ok(outcome)
            }
            Err(e) => {
                self.metrics.increment_protocol_violations();
                Err(e)
            }
        }
    }

    /// Move to a new replica version; a fresh handshake is required.
    pub fn set_replica_version(&mut self, replica_version: ReplicaVersion) {
        self.descriptor.replica_version = replica_version;
        self.handler
            .set_replica_version(replica_version, self.clock.now_ms());
    }

    pub fn set_epoch(&mut self, epoch: Epoch) {
        self.handler.set_epoch(epoch);
    }

    /// Resume intake after an aligned barrier.
    pub fn unblock(&mut self) {
        self.handler.unblock();
    }

    pub fn offer_heartbeat(&mut self) -> bool {
        self.offer_status(FrameBody::Heartbeat)
    }

    /// Acknowledge the publisher's handshake for the current version.
    pub fn offer_ready_reply(&mut self) -> bool {
        self.offer_status(FrameBody::ReadyReplyAck)
    }

    pub fn offer_barrier_aligned(&mut self, epoch: Epoch) -> bool {
        self.offer_status(FrameBody::BarrierAlignedAck { epoch })
    }

    fn offer_status(&mut self, body: FrameBody) -> bool {
        let name = body.name();
        let frame = Frame::new(
            FrameHeader::for_key(&self.descriptor.key, self.descriptor.replica_version),
            body,
        );
        let offered = match (&mut self.status, frame.encode()) {
            (Some(status), Ok(bytes)) => status.offer(&bytes),
            _ => false,
        };
        if !offered {
            self.metrics.increment_status_offers_failed();
            debug!(
                src_peer = %self.descriptor.key.src_peer_id,
                task = %self.descriptor.key.dst_task_id,
                slot = self.descriptor.key.slot_id,
                frame = name,
                "status offer not accepted"
            );
        }
        offered
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.descriptor.key
    }

    pub fn descriptor(&self) -> &SubscriberDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> HandlerState {
        self.handler.state()
    }

    pub fn epoch(&self) -> Epoch {
        self.handler.epoch()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.handler.session_id()
    }

    pub fn recovery_info(&self) -> Option<&serde_json::Value> {
        self.handler.recovery_info()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.stop();
    }
}
