//! Log subscriber installation
//!
//! All components log through `tracing` macros with structured fields.
//! This installs the process-wide `fmt` subscriber that renders them to
//! stderr, leaving stdout to command output.

use tracing_subscriber::EnvFilter;

use super::{ObservabilityError, ObservabilityResult};

/// Environment variable holding an `EnvFilter` directive.
pub const LOG_ENV_VAR: &str = "AEROFLOW_LOG";

/// Output format of the installed subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable single lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Build the filter from `AEROFLOW_LOG`, falling back to `default_directive`.
pub fn build_filter(default_directive: &str) -> ObservabilityResult<EnvFilter> {
    match std::env::var(LOG_ENV_VAR) {
        Ok(directive) if !directive.trim().is_empty() => EnvFilter::try_new(directive)
            .map_err(|e| ObservabilityError::new(format!("invalid {}: {}", LOG_ENV_VAR, e))),
        _ => EnvFilter::try_new(default_directive).map_err(|e| {
            ObservabilityError::new(format!("invalid log directive '{}': {}", default_directive, e))
        }),
    }
}

/// Install the global subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(default_directive: &str, format: LogFormat) -> ObservabilityResult<()> {
    let filter = build_filter(default_directive)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .with_target(true);

    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };

    result.map_err(|e| ObservabilityError::new(format!("failed to install subscriber: {}", e)))
}
