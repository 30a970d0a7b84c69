//! Transport abstraction
//!
//! The underlying transport is unreliable and session oriented: fragments
//! are ordered within a session, but may be redelivered after a reconnect,
//! there is no deduplication, and the only backpressure is the fragment
//! limit of each poll. Wire bytes are the implementation's concern.

use super::channel::ChannelAddress;
use super::errors::MessagingResult;
use super::frame::{Position, SessionId};

/// One fragment handed to a poll callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub session_id: SessionId,
    /// Transport position of this fragment within its session
    pub position: Position,
    pub bytes: Vec<u8>,
}

/// What the poll callback did with a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollAction {
    /// Consumed; keep polling
    Continue,
    /// Consumed; end this poll
    Break,
    /// Not consumed; end this poll and redeliver the fragment next time
    Abort,
}

/// Receiving end of a data stream.
pub trait Subscription: Send {
    /// Hand up to `fragment_limit` fragments to `handler` in order.
    ///
    /// Returns the number of fragments consumed. An aborted fragment is
    /// not counted and is the first one offered on the next poll.
    fn poll(&mut self, handler: &mut dyn FnMut(&Delivery) -> PollAction, fragment_limit: usize)
        -> usize;

    fn is_connected(&self) -> bool;

    fn close(&mut self);
}

/// Sending end of a status stream.
pub trait Publication: Send {
    /// Best-effort send. `false` means the transport refused the frame
    /// (back pressure, not connected); callers resend periodically.
    fn offer(&mut self, bytes: &[u8]) -> bool;

    fn close(&mut self);
}

/// Factory for subscriptions and publications.
pub trait Transport: Send + Sync {
    fn subscribe(&self, address: &ChannelAddress) -> MessagingResult<Box<dyn Subscription>>;

    fn publish(&self, address: &ChannelAddress) -> MessagingResult<Box<dyn Publication>>;
}
