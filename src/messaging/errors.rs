//! Messaging error types
//!
//! Only conditions that must tear a subscription down are errors.
//! Stale or duplicate frames and not-yet-caught-up frames are expected
//! under redelivery and are handled inside the poll cycle without
//! producing an error.

use std::fmt;

use super::frame::{Epoch, ReplicaVersion};

/// Messaging error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagingError {
    /// Error kind
    pub kind: MessagingErrorKind,
    /// Error message
    pub message: String,
}

/// Messaging error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagingErrorKind {
    /// Sender broke the barrier/session protocol
    ProtocolViolation,

    /// Transport refused to open a subscription or publication
    Transport,

    /// Operation needs a started subscriber
    NotStarted,
}

impl MessagingError {
    /// Create a new messaging error.
    pub fn new(kind: MessagingErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create a protocol violation error.
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self::new(MessagingErrorKind::ProtocolViolation, message)
    }

    /// A barrier arrived whose epoch is not exactly one past the aligned epoch.
    pub fn unexpected_epoch(expected: Epoch, received: Epoch) -> Self {
        Self::protocol_violation(format!(
            "unexpected barrier epoch: expected {}, received {}",
            expected, received
        ))
    }

    /// The sender moved to a replica version this subscriber never acknowledged.
    pub fn replica_version_ahead(local: ReplicaVersion, received: ReplicaVersion) -> Self {
        Self::protocol_violation(format!(
            "sender replica version {} is ahead of local version {}",
            received, local
        ))
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(MessagingErrorKind::Transport, message)
    }

    /// Create a not-started error.
    pub fn not_started(message: impl Into<String>) -> Self {
        Self::new(MessagingErrorKind::NotStarted, message)
    }

    /// Check if this error requires tearing the subscription down.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, MessagingErrorKind::ProtocolViolation)
    }

    pub fn is_protocol_violation(&self) -> bool {
        self.kind == MessagingErrorKind::ProtocolViolation
    }
}

impl fmt::Display for MessagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessagingError({:?}): {}", self.kind, self.message)
    }
}

impl std::error::Error for MessagingError {}

/// Result type for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_violation_is_fatal() {
        assert!(MessagingError::protocol_violation("test").is_fatal());
        assert!(MessagingError::unexpected_epoch(2, 4).is_fatal());
        assert!(MessagingError::replica_version_ahead(1, 2).is_fatal());
    }

    #[test]
    fn test_non_fatal_errors() {
        assert!(!MessagingError::transport("test").is_fatal());
        assert!(!MessagingError::not_started("test").is_fatal());
    }

    #[test]
    fn test_unexpected_epoch_message() {
        let err = MessagingError::unexpected_epoch(3, 5);
        let display = err.to_string();
        assert!(display.contains("ProtocolViolation"));
        assert!(display.contains("expected 3"));
        assert!(display.contains("received 5"));
    }
}
