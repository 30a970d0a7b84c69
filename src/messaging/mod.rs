//! Barrier-synchronized, deduplicating message transport
//!
//! Layered on an unreliable, session-ordered transport (see [`Transport`]).
//! Guarantees that each transport position reaches application logic at
//! most once and that barrier epochs are aligned strictly in sequence.
//!
//! # Components
//!
//! - [`TicketRegistry`]: last consumed position per `(source, session)`,
//!   shared by every subscription fed by that session
//! - [`Handler`]: per-subscription state machine classifying frames
//! - [`Subscriber`]: transport resources, liveness and status frames
//! - [`SubscriberSet`] / [`reconcile`]: keeps live subscribers in line with
//!   the desired topology
//!
//! # Poll cycle
//!
//! Each cycle hands fragments to the handler, which answers with a
//! [`PollAction`]. `Abort` leaves the fragment in the transport so it is
//! offered again on the next cycle; this is how the per-cycle message cap,
//! the not-yet-caught-up wait and barrier isolation are expressed.
//!
//! # Failure model
//!
//! Stale, duplicate and early frames are not errors. A protocol violation
//! ends the subscription: the error is sticky and the subscriber must be
//! recreated. It never terminates the process.

mod channel;
mod errors;
mod frame;
mod handler;
mod loopback;
mod reconciler;
mod subscriber;
mod ticket;
mod transport;

pub use channel::ChannelAddress;
pub use errors::{MessagingError, MessagingErrorKind, MessagingResult};
pub use frame::{
    Epoch, Frame, FrameBody, FrameHeader, JobId, PeerId, Position, ReplicaVersion, SessionId,
    SlotId, SubscriptionKey, TaskId,
};
pub use handler::{Handler, HandlerState, PollOutcome};
pub use loopback::LoopbackTransport;
pub use reconciler::{reconcile, ReconcileAction, ReconcileSummary, SubscriberSet};
pub use subscriber::{Clock, ManualClock, Subscriber, SubscriberDescriptor, SystemClock};
pub use ticket::{Ticket, TicketRegistry, BEFORE_FIRST_POSITION};
pub use transport::{Delivery, PollAction, Publication, Subscription, Transport};
