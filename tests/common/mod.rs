//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use aeroflow::config::MessagingConfig;
use aeroflow::messaging::{
    ChannelAddress, Clock, Frame, FrameHeader, LoopbackTransport, ManualClock, SessionId,
    Subscriber, SubscriberDescriptor, SubscriptionKey, TicketRegistry, Transport,
};
use aeroflow::observability::MetricsRegistry;
use uuid::Uuid;

pub const UPSTREAM: Uuid = Uuid::from_u128(0xA1);

pub fn descriptor(site: &str, replica_version: u64) -> SubscriberDescriptor {
    SubscriberDescriptor {
        key: SubscriptionKey::new(UPSTREAM, "window-task", 0, site),
        job_id: "job-1".to_string(),
        status_site: "upstream:40200".to_string(),
        replica_version,
    }
}

pub fn header(descriptor: &SubscriberDescriptor) -> FrameHeader {
    FrameHeader::for_key(&descriptor.key, descriptor.replica_version)
}

/// Everything a test needs to build subscribers against one transport.
pub struct Harness {
    pub transport: Arc<LoopbackTransport>,
    pub tickets: Arc<TicketRegistry>,
    pub clock: Arc<ManualClock>,
    pub metrics: Arc<MetricsRegistry>,
    pub config: MessagingConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            transport: Arc::new(LoopbackTransport::new()),
            tickets: Arc::new(TicketRegistry::new()),
            clock: Arc::new(ManualClock::new(1_000)),
            metrics: Arc::new(MetricsRegistry::new()),
            config: MessagingConfig::default(),
        }
    }

    /// Enqueue `frame` at `position` of `session_id` on `address`.
    pub fn send(
        &self,
        address: &ChannelAddress,
        session_id: SessionId,
        position: i64,
        frame: &Frame,
    ) {
        self.transport
            .deliver(address, session_id, position, frame)
            .unwrap();
    }

    pub fn subscriber(&self, descriptor: SubscriberDescriptor) -> Subscriber {
        let mut subscriber = Subscriber::new(
            descriptor,
            Arc::clone(&self.transport) as Arc<dyn Transport>,
            Arc::clone(&self.tickets),
            &self.config,
            Arc::clone(&self.clock) as Arc<dyn Clock>,
            Arc::clone(&self.metrics),
        );
        subscriber.start().unwrap();
        subscriber
    }
}
