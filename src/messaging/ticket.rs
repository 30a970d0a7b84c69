//! Ticket registry for delivery deduplication
//!
//! A ticket holds the last consumed transport position for one
//! `(source peer, session)` pair. Every subscription fed by that session
//! shares the ticket, so a position is handed to application logic at most
//! once no matter how many times the transport redelivers it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use super::frame::{PeerId, Position, SessionId};

/// Value of a fresh ticket, below every real position
pub const BEFORE_FIRST_POSITION: Position = -1;

/// Last consumed position for one `(source, session)` pair.
#[derive(Debug)]
pub struct Ticket {
    position: AtomicI64,
}

impl Ticket {
    fn new() -> Self {
        Self {
            position: AtomicI64::new(BEFORE_FIRST_POSITION),
        }
    }

    /// Claim `position`.
    ///
    /// Returns `true` iff `position` is beyond every position claimed
    /// before, in which case the ticket now holds it. Returns `false` for a
    /// redelivered or overtaken position; that is not an error.
    pub fn try_accept(&self, position: Position) -> bool {
        self.position.fetch_max(position, Ordering::AcqRel) < position
    }

    /// Last claimed position.
    pub fn position(&self) -> Position {
        self.position.load(Ordering::Acquire)
    }
}

/// Shared map of tickets, created lazily on first use.
///
/// Tickets are never removed while the registry lives; sessions are not
/// known in advance and two subscriptions may resolve the same pair
/// concurrently.
#[derive(Debug, Default)]
pub struct TicketRegistry {
    tickets: RwLock<HashMap<(PeerId, SessionId), Arc<Ticket>>>,
}

impl TicketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the ticket for `(src_peer_id, session_id)`, creating it if absent.
    pub fn resolve(&self, src_peer_id: PeerId, session_id: SessionId) -> Arc<Ticket> {
        let key = (src_peer_id, session_id);

        {
            let tickets = self.tickets.read().unwrap_or_else(|e| e.into_inner());
            if let Some(ticket) = tickets.get(&key) {
                return Arc::clone(ticket);
            }
        }

        let mut tickets = self.tickets.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(tickets.entry(key).or_insert_with(|| Arc::new(Ticket::new())))
    }

    /// Number of tickets created so far.
    pub fn len(&self) -> usize {
        self.tickets.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use uuid::Uuid;

    #[test]
    fn test_fresh_ticket_accepts_position_zero() {
        let registry = TicketRegistry::new();
        let ticket = registry.resolve(Uuid::from_u128(1), 10);
        assert_eq!(ticket.position(), BEFORE_FIRST_POSITION);
        assert!(ticket.try_accept(0));
        assert_eq!(ticket.position(), 0);
    }

    #[test]
    fn test_duplicates_and_stale_positions_rejected() {
        let ticket = Ticket::new();
        assert!(ticket.try_accept(64));
        assert!(!ticket.try_accept(64));
        assert!(!ticket.try_accept(32));
        assert!(ticket.try_accept(96));
        assert_eq!(ticket.position(), 96);
    }

    #[test]
    fn test_same_pair_shares_ticket() {
        let registry = TicketRegistry::new();
        let peer = Uuid::from_u128(1);

        let a = registry.resolve(peer, 5);
        let b = registry.resolve(peer, 5);
        assert!(Arc::ptr_eq(&a, &b));

        let other_session = registry.resolve(peer, 6);
        assert!(!Arc::ptr_eq(&a, &other_session));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_redelivery_accepts_each_position_once() {
        let ticket = Ticket::new();
        let deliveries = [0, 32, 32, 64, 0, 32, 96, 64, 128, 128];

        let accepted: Vec<Position> = deliveries
            .iter()
            .copied()
            .filter(|p| ticket.try_accept(*p))
            .collect();

        assert_eq!(accepted, vec![0, 32, 64, 96, 128]);
    }

    #[test]
    fn test_concurrent_first_use_creates_one_ticket() {
        let registry = Arc::new(TicketRegistry::new());
        let peer = Uuid::from_u128(9);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.resolve(peer, 1))
            })
            .collect();

        let tickets: Vec<Arc<Ticket>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(registry.len(), 1);
        assert!(tickets.iter().all(|t| Arc::ptr_eq(t, &tickets[0])));
    }

    #[test]
    fn test_concurrent_claims_accept_position_once() {
        let ticket = Arc::new(Ticket::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ticket = Arc::clone(&ticket);
                thread::spawn(move || (0..100).filter(|p| ticket.try_accept(*p)).count())
            })
            .collect();

        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(total <= 100);
        assert_eq!(ticket.position(), 99);
    }
}
