//! Runtime configuration for aeroflow
//!
//! Loaded from a JSON file. Every field has a default so a partial file
//! (or `{}`) is a valid configuration. Validation runs on load.
//!
//! ```json
//! {
//!   "messaging": { "liveness_timeout_ms": 10000, "max_messages_per_poll": 2 },
//!   "checkpoint": { "write_batch_size": 20, "ledger_password": "secret" }
//! }
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::{DigestType, LedgerOptions};

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid JSON for this schema
    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Top-level configuration file structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AeroflowConfig {
    #[serde(default)]
    pub messaging: MessagingConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl AeroflowConfig {
    /// Load and validate configuration from a JSON file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate configuration from a JSON string.
    pub fn from_json(content: &str) -> ConfigResult<Self> {
        let config: AeroflowConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> ConfigResult<()> {
        self.messaging.validate()?;
        self.checkpoint.validate()
    }
}

/// Options for the subscriber side of the messaging layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// A subscriber with no heartbeat for this long is presumed dead
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,

    /// Messages accepted in one poll cycle before the cycle stops
    #[serde(default = "default_max_messages_per_poll")]
    pub max_messages_per_poll: usize,

    /// Fragment limit handed to the transport on each poll
    #[serde(default = "default_poll_fragment_limit")]
    pub poll_fragment_limit: usize,
}

fn default_liveness_timeout_ms() -> u64 {
    10_000
}
fn default_max_messages_per_poll() -> usize {
    2
}
fn default_poll_fragment_limit() -> usize {
    10
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_ms: default_liveness_timeout_ms(),
            max_messages_per_poll: default_max_messages_per_poll(),
            poll_fragment_limit: default_poll_fragment_limit(),
        }
    }
}

impl MessagingConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.liveness_timeout_ms == 0 {
            return Err(ConfigError::invalid("messaging.liveness_timeout_ms", "must be > 0"));
        }
        if self.max_messages_per_poll == 0 {
            return Err(ConfigError::invalid("messaging.max_messages_per_poll", "must be > 0"));
        }
        if self.poll_fragment_limit == 0 {
            return Err(ConfigError::invalid("messaging.poll_fragment_limit", "must be > 0"));
        }
        Ok(())
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }
}

/// Options for the checkpoint log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Maximum entries drained into one appended batch
    #[serde(default = "default_write_batch_size")]
    pub write_batch_size: usize,

    /// Maximum time spent draining one batch
    #[serde(default = "default_write_batch_timeout_ms")]
    pub write_batch_timeout_ms: u64,

    /// Entries fetched per read during playback
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: u64,

    /// Capacity of the writer's inbound queue
    #[serde(default = "default_write_buffer_capacity")]
    pub write_buffer_capacity: usize,

    #[serde(default = "default_ensemble_size")]
    pub ensemble_size: u32,

    #[serde(default = "default_quorum_size")]
    pub quorum_size: u32,

    #[serde(default = "default_ledger_password")]
    pub ledger_password: String,

    #[serde(default)]
    pub digest: DigestType,

    /// Connect timeout for networked log store clients. Recognized for
    /// configuration compatibility; neither bundled store reads it.
    #[serde(default = "default_client_connect_timeout_ms")]
    pub client_connect_timeout_ms: u64,

    /// Throttle for networked log store clients. Recognized for
    /// configuration compatibility; neither bundled store reads it.
    #[serde(default = "default_client_throttle_ms")]
    pub client_throttle_ms: u64,

    /// Sleep between checks that a new segment id has been registered
    #[serde(default = "default_segment_id_backoff_ms")]
    pub segment_id_backoff_ms: u64,

    /// Checks before segment registration is abandoned
    #[serde(default = "default_segment_id_max_retries")]
    pub segment_id_max_retries: u32,
}

fn default_write_batch_size() -> usize {
    20
}
fn default_write_batch_timeout_ms() -> u64 {
    50
}
fn default_read_chunk_size() -> u64 {
    100
}
fn default_write_buffer_capacity() -> usize {
    10_000
}
fn default_ensemble_size() -> u32 {
    3
}
fn default_quorum_size() -> u32 {
    3
}
fn default_ledger_password() -> String {
    "INSECUREDEFAULTPASSWORD".to_string()
}
fn default_client_connect_timeout_ms() -> u64 {
    60_000
}
fn default_client_throttle_ms() -> u64 {
    30_000
}
fn default_segment_id_backoff_ms() -> u64 {
    50
}
fn default_segment_id_max_retries() -> u32 {
    200
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            write_batch_size: default_write_batch_size(),
            write_batch_timeout_ms: default_write_batch_timeout_ms(),
            read_chunk_size: default_read_chunk_size(),
            write_buffer_capacity: default_write_buffer_capacity(),
            ensemble_size: default_ensemble_size(),
            quorum_size: default_quorum_size(),
            ledger_password: default_ledger_password(),
            digest: DigestType::default(),
            client_connect_timeout_ms: default_client_connect_timeout_ms(),
            client_throttle_ms: default_client_throttle_ms(),
            segment_id_backoff_ms: default_segment_id_backoff_ms(),
            segment_id_max_retries: default_segment_id_max_retries(),
        }
    }
}

impl CheckpointConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.write_batch_size == 0 {
            return Err(ConfigError::invalid("checkpoint.write_batch_size", "must be > 0"));
        }
        if self.read_chunk_size == 0 {
            return Err(ConfigError::invalid("checkpoint.read_chunk_size", "must be > 0"));
        }
        if self.write_buffer_capacity == 0 {
            return Err(ConfigError::invalid("checkpoint.write_buffer_capacity", "must be > 0"));
        }
        if self.quorum_size == 0 || self.quorum_size > self.ensemble_size {
            return Err(ConfigError::invalid(
                "checkpoint.quorum_size",
                format!(
                    "must be between 1 and ensemble_size ({}), got {}",
                    self.ensemble_size, self.quorum_size
                ),
            ));
        }
        if self.segment_id_max_retries == 0 {
            return Err(ConfigError::invalid("checkpoint.segment_id_max_retries", "must be > 0"));
        }
        Ok(())
    }

    pub fn write_batch_timeout(&self) -> Duration {
        Duration::from_millis(self.write_batch_timeout_ms)
    }

    pub fn segment_id_backoff(&self) -> Duration {
        Duration::from_millis(self.segment_id_backoff_ms)
    }

    /// Options for every segment this peer creates.
    pub fn ledger_options(&self) -> LedgerOptions {
        LedgerOptions {
            ensemble_size: self.ensemble_size,
            quorum_size: self.quorum_size,
            digest: self.digest,
            password: self.ledger_password.clone().into_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = AeroflowConfig::from_json("{}").unwrap();
        assert_eq!(config, AeroflowConfig::default());
        assert_eq!(config.messaging.max_messages_per_poll, 2);
        assert_eq!(config.checkpoint.write_batch_size, 20);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = AeroflowConfig::from_json(
            r#"{"messaging": {"liveness_timeout_ms": 500}, "checkpoint": {"read_chunk_size": 7}}"#,
        )
        .unwrap();
        assert_eq!(config.messaging.liveness_timeout_ms, 500);
        assert_eq!(config.messaging.poll_fragment_limit, 10);
        assert_eq!(config.checkpoint.read_chunk_size, 7);
        assert_eq!(config.checkpoint.quorum_size, 3);
    }

    #[test]
    fn test_client_settings_accepted_without_effect() {
        let config = AeroflowConfig::from_json(
            r#"{"checkpoint": {"client_connect_timeout_ms": 1, "client_throttle_ms": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.checkpoint.client_connect_timeout_ms, 1);
        assert_eq!(config.checkpoint.client_throttle_ms, 2);
        assert_eq!(
            config.checkpoint.ledger_options(),
            CheckpointConfig::default().ledger_options()
        );
    }

    #[test]
    fn test_quorum_larger_than_ensemble_rejected() {
        let err = AeroflowConfig::from_json(
            r#"{"checkpoint": {"ensemble_size": 2, "quorum_size": 3}}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("checkpoint.quorum_size"));
    }

    #[test]
    fn test_zero_batch_cap_rejected() {
        let result = AeroflowConfig::from_json(r#"{"messaging": {"max_messages_per_poll": 0}}"#);
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"checkpoint": {"ledger_password": "pw"}}"#)
            .unwrap();

        let config = AeroflowConfig::load(file.path()).unwrap();
        assert_eq!(config.checkpoint.ledger_options().password, b"pw".to_vec());
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let result = AeroflowConfig::load(Path::new("/nonexistent/aeroflow.json"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
