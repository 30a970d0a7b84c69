//! In-process loopback transport
//!
//! One fragment queue per channel address. Honours the abort/redeliver
//! contract of [`Subscription::poll`]. Status frames offered on any
//! publication are decoded and kept for inspection.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use super::channel::ChannelAddress;
use super::errors::MessagingResult;
use super::frame::{Frame, Position, SessionId};
use super::transport::{Delivery, PollAction, Publication, Subscription, Transport};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct Stream {
    queue: VecDeque<Delivery>,
    closed: bool,
}

/// Transport whose streams live in memory.
#[derive(Default)]
pub struct LoopbackTransport {
    streams: Mutex<HashMap<ChannelAddress, Arc<Mutex<Stream>>>>,
    sent: Arc<Mutex<Vec<Frame>>>,
    refuse_offers: Arc<AtomicBool>,
    subscribes: AtomicUsize,
    closes: Arc<AtomicUsize>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&self, address: &ChannelAddress) -> Arc<Mutex<Stream>> {
        let mut streams = lock(&self.streams);
        Arc::clone(streams.entry(address.clone()).or_default())
    }

    /// Enqueue `frame` at `position` of `session_id` on `address`.
    pub fn deliver(
        &self,
        address: &ChannelAddress,
        session_id: SessionId,
        position: Position,
        frame: &Frame,
    ) -> MessagingResult<()> {
        self.deliver_bytes(address, session_id, position, frame.encode()?);
        Ok(())
    }

    /// Enqueue a raw fragment.
    pub fn deliver_bytes(
        &self,
        address: &ChannelAddress,
        session_id: SessionId,
        position: Position,
        bytes: Vec<u8>,
    ) {
        lock(&self.stream(address)).queue.push_back(Delivery {
            session_id,
            position,
            bytes,
        });
    }

    /// Fragments not yet consumed on `address`.
    pub fn queued(&self, address: &ChannelAddress) -> usize {
        lock(&self.stream(address)).queue.len()
    }

    /// Status frames accepted so far, in offer order.
    pub fn sent(&self) -> Vec<Frame> {
        lock(&self.sent).clone()
    }

    /// Make every publication refuse offers (back pressure).
    pub fn refuse_offers(&self, refuse: bool) {
        self.refuse_offers.store(refuse, Ordering::SeqCst);
    }

    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

struct LoopbackSubscription {
    stream: Arc<Mutex<Stream>>,
    closes: Arc<AtomicUsize>,
}

impl Subscription for LoopbackSubscription {
    fn poll(
        &mut self,
        handler: &mut dyn FnMut(&Delivery) -> PollAction,
        fragment_limit: usize,
    ) -> usize {
        let mut stream = lock(&self.stream);
        let mut consumed = 0;
        while consumed < fragment_limit {
            let Some(delivery) = stream.queue.front().cloned() else {
                break;
            };
            match handler(&delivery) {
                PollAction::Continue => {
                    stream.queue.pop_front();
                    consumed += 1;
                }
                PollAction::Break => {
                    stream.queue.pop_front();
                    consumed += 1;
                    break;
                }
                PollAction::Abort => break,
            }
        }
        consumed
    }

    fn is_connected(&self) -> bool {
        !lock(&self.stream).closed
    }

    fn close(&mut self) {
        lock(&self.stream).closed = true;
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

struct LoopbackPublication {
    sent: Arc<Mutex<Vec<Frame>>>,
    refuse: Arc<AtomicBool>,
}

impl Publication for LoopbackPublication {
    fn offer(&mut self, bytes: &[u8]) -> bool {
        if self.refuse.load(Ordering::SeqCst) {
            return false;
        }
        match Frame::decode(bytes) {
            Ok(frame) => {
                lock(&self.sent).push(frame);
                true
            }
            Err(e) => {
                debug!(error = %e, "loopback publication refused undecodable frame");
                false
            }
        }
    }

    fn close(&mut self) {}
}

impl Transport for LoopbackTransport {
    fn subscribe(&self, address: &ChannelAddress) -> MessagingResult<Box<dyn Subscription>> {
        let stream = self.stream(address);
        lock(&stream).closed = false;
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LoopbackSubscription {
            stream,
            closes: Arc::clone(&self.closes),
        }))
    }

    fn publish(&self, _address: &ChannelAddress) -> MessagingResult<Box<dyn Publication>> {
        Ok(Box::new(LoopbackPublication {
            sent: Arc::clone(&self.sent),
            refuse: Arc::clone(&self.refuse_offers),
        }))
    }
}
