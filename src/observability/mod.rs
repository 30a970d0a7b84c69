//! Observability subsystem for aeroflow
//!
//! - Structured logging through `tracing`, rendered by `tracing-subscriber`
//! - Counter metrics shared across subscribers, writers and playback
//!
//! Observability never affects execution: a failure to install the log
//! subscriber is reported, not fatal.
//!
//! # Usage
//!
//! ```ignore
//! use aeroflow::observability::{init_logging, LogFormat, MetricsRegistry};
//!
//! init_logging("info", LogFormat::Text)?;
//! let metrics = MetricsRegistry::new();
//! metrics.increment_barriers_aligned();
//! ```

mod logger;
mod metrics;

pub use logger::{build_filter, init_logging, LogFormat, LOG_ENV_VAR};
pub use metrics::{MetricsRegistry, MetricsSnapshot};

use std::fmt;

/// Observability error
///
/// Never fatal; callers log it and continue.
#[derive(Debug, Clone)]
pub struct ObservabilityError {
    message: String,
}

impl ObservabilityError {
    /// Create a new observability error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Get the message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Observability errors are never fatal
    pub fn is_fatal(&self) -> bool {
        false
    }
}

impl fmt::Display for ObservabilityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "observability: {}", self.message)
    }
}

impl std::error::Error for ObservabilityError {}

/// Result type for observability operations
pub type ObservabilityResult<T> = Result<T, ObservabilityError>;
