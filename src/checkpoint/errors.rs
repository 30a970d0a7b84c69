//! Checkpoint log error types
//!
//! Errors carry a structured code in `AEROFLOW_CHECKPOINT_*` format and a
//! severity. A `Fatal` error means the log cannot be trusted for playback
//! (corrupt or foreign segment); everything else fails the operation and
//! leaves previously acknowledged entries intact.
//!
//! Errors are `Clone`: one failed append is reported to every callback of
//! the batch it carried.

use std::fmt;
use std::io;
use std::sync::Arc;

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Operation failed; log state is consistent
    Error,
    /// Log contents cannot be used
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "ERROR"),
            Severity::Fatal => write!(f, "FATAL"),
        }
    }
}

/// Checkpoint error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointErrorCode {
    /// Log store I/O failed
    LogStoreFailed,
    /// No segment with the requested id
    LedgerNotFound,
    /// Append to a closed segment
    LedgerSealed,
    /// Segment password mismatch
    BadPassword,
    /// Stored bytes fail their checksum or framing
    Corruption,
    /// Entry could not be encoded or decoded
    Serialization,
    /// Update names a window with no registered aggregation
    UnknownWindow,
    /// Segment id never showed up in the registered chain
    RegistrationTimeout,
    /// Operation interrupted by shutdown
    Shutdown,
    /// Batch writer no longer accepts work
    WriterClosed,
}

impl CheckpointErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointErrorCode::LogStoreFailed => "AEROFLOW_CHECKPOINT_LOG_STORE_FAILED",
            CheckpointErrorCode::LedgerNotFound => "AEROFLOW_CHECKPOINT_LEDGER_NOT_FOUND",
            CheckpointErrorCode::LedgerSealed => "AEROFLOW_CHECKPOINT_LEDGER_SEALED",
            CheckpointErrorCode::BadPassword => "AEROFLOW_CHECKPOINT_BAD_PASSWORD",
            CheckpointErrorCode::Corruption => "AEROFLOW_CHECKPOINT_CORRUPTION",
            CheckpointErrorCode::Serialization => "AEROFLOW_CHECKPOINT_SERIALIZATION",
            CheckpointErrorCode::UnknownWindow => "AEROFLOW_CHECKPOINT_UNKNOWN_WINDOW",
            CheckpointErrorCode::RegistrationTimeout => {
                "AEROFLOW_CHECKPOINT_REGISTRATION_TIMEOUT"
            }
            CheckpointErrorCode::Shutdown => "AEROFLOW_CHECKPOINT_SHUTDOWN",
            CheckpointErrorCode::WriterClosed => "AEROFLOW_CHECKPOINT_WRITER_CLOSED",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            CheckpointErrorCode::Corruption | CheckpointErrorCode::BadPassword => Severity::Fatal,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for CheckpointErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Checkpoint error with full context
#[derive(Debug, Clone)]
pub struct CheckpointError {
    code: CheckpointErrorCode,
    message: String,
    source: Option<Arc<io::Error>>,
}

impl CheckpointError {
    fn new(code: CheckpointErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    fn with_source(mut self, source: io::Error) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Log store failure caused by an I/O error
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Self::new(CheckpointErrorCode::LogStoreFailed, message).with_source(source)
    }

    /// Log store failure without an underlying I/O error
    pub fn log_store(message: impl Into<String>) -> Self {
        Self::new(CheckpointErrorCode::LogStoreFailed, message)
    }

    pub fn ledger_not_found(id: u64) -> Self {
        Self::new(
            CheckpointErrorCode::LedgerNotFound,
            format!("ledger {} does not exist", id),
        )
    }

    pub fn ledger_sealed(id: u64) -> Self {
        Self::new(
            CheckpointErrorCode::LedgerSealed,
            format!("ledger {} is closed", id),
        )
    }

    pub fn bad_password(id: u64) -> Self {
        Self::new(
            CheckpointErrorCode::BadPassword,
            format!("password does not match ledger {}", id),
        )
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        Self::new(CheckpointErrorCode::Corruption, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(CheckpointErrorCode::Serialization, message)
    }

    pub fn unknown_window(window_id: &str) -> Self {
        Self::new(
            CheckpointErrorCode::UnknownWindow,
            format!("no aggregation registered for window {}", window_id),
        )
    }

    pub fn registration_timeout(ledger_id: u64, attempts: u32) -> Self {
        Self::new(
            CheckpointErrorCode::RegistrationTimeout,
            format!(
                "ledger {} not registered after {} attempts",
                ledger_id, attempts
            ),
        )
    }

    pub fn shutdown(message: impl Into<String>) -> Self {
        Self::new(CheckpointErrorCode::Shutdown, message)
    }

    pub fn writer_closed() -> Self {
        Self::new(
            CheckpointErrorCode::WriterClosed,
            "batch writer is shut down",
        )
    }

    pub fn code(&self) -> CheckpointErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    /// Whether the log must not be used for playback
    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}: {}",
            self.code.severity(),
            self.code,
            self.message
        )?;
        if let Some(ref source) = self.source {
            write!(f, " (caused by: {})", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for CheckpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        CheckpointError::serialization(err.to_string())
    }
}

/// Result type for checkpoint operations
pub type CheckpointResult<T> = Result<T, CheckpointError>;
