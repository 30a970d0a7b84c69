//! Ledger metadata sidecar
//!
//! Each on-disk segment `ledger-<id>.log` has a JSON sidecar
//! `ledger-<id>.meta.json` recording its creation options, a digest of its
//! password and whether it has been sealed. The sidecar is rewritten
//! through a temp file and rename, with fsync of file and directory, so a
//! reader sees either the old or the new marker.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use super::errors::{CheckpointError, CheckpointResult};
use super::store::{DigestType, LedgerId, LedgerOptions};

/// Persisted metadata of one segment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerMarker {
    pub ledger_id: LedgerId,
    pub ensemble_size: u32,
    pub quorum_size: u32,
    pub digest: DigestType,
    /// CRC32 of the password; the password itself is not stored
    pub password_digest: u32,
    /// RFC3339 creation time
    pub created_at: String,
    pub sealed: bool,
    /// Always 1
    pub format_version: u8,
}

impl LedgerMarker {
    pub fn new(ledger_id: LedgerId, options: &LedgerOptions) -> Self {
        Self {
            ledger_id,
            ensemble_size: options.ensemble_size,
            quorum_size: options.quorum_size,
            digest: options.digest,
            password_digest: password_digest(&options.password),
            created_at: Utc::now().to_rfc3339(),
            sealed: false,
            format_version: 1,
        }
    }

    pub fn password_matches(&self, password: &[u8]) -> bool {
        self.password_digest == password_digest(password)
    }

    pub fn to_json(&self) -> CheckpointResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            CheckpointError::serialization(format!(
                "failed to serialize marker for ledger {}: {}",
                self.ledger_id, e
            ))
        })
    }

    pub fn from_json(json: &str) -> CheckpointResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| CheckpointError::corruption(format!("unreadable ledger marker: {}", e)))
    }

    /// Durably replace the marker at `path`.
    pub fn write_to_file(&self, path: &Path) -> CheckpointResult<()> {
        let json = self.to_json()?;
        let tmp = path.with_extension("json.tmp");

        let mut file = File::create(&tmp).map_err(|e| {
            CheckpointError::io(format!("failed to create marker: {}", tmp.display()), e)
        })?;
        file.write_all(json.as_bytes()).map_err(|e| {
            CheckpointError::io(format!("failed to write marker: {}", tmp.display()), e)
        })?;
        file.sync_all().map_err(|e| {
            CheckpointError::io(format!("failed to fsync marker: {}", tmp.display()), e)
        })?;
        drop(file);

        fs::rename(&tmp, path).map_err(|e| {
            CheckpointError::io(format!("failed to install marker: {}", path.display()), e)
        })?;

        if let Some(parent) = path.parent() {
            let dir = OpenOptions::new().read(true).open(parent).map_err(|e| {
                CheckpointError::io(
                    format!("failed to open ledger directory: {}", parent.display()),
                    e,
                )
            })?;
            dir.sync_all().map_err(|e| {
                CheckpointError::io(
                    format!("failed to fsync ledger directory: {}", parent.display()),
                    e,
                )
            })?;
        }
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> CheckpointResult<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            CheckpointError::io(format!("failed to read marker: {}", path.display()), e)
        })?;
        Self::from_json(&contents)
    }
}

fn password_digest(password: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(password);
    hasher.finalize()
}

/// Path of the entry file for `id` in `dir`
pub fn ledger_path(dir: &Path, id: LedgerId) -> PathBuf {
    dir.join(format!("ledger-{:020}.log", id))
}

/// Path of the marker for `id` in `dir`
pub fn marker_path(dir: &Path, id: LedgerId) -> PathBuf {
    dir.join(format!("ledger-{:020}.meta.json", id))
}

/// Ledger id named by a marker file name, if it is one.
pub fn parse_marker_name(name: &str) -> Option<LedgerId> {
    name.strip_prefix("ledger-")?
        .strip_suffix(".meta.json")?
        .parse()
        .ok()
}
