//! File-backed log store
//!
//! One directory holds every segment. Entries are framed as
//!
//! ```text
//! [len: u32 LE][checksum: u32 LE][bytes: len]
//! ```
//!
//! and each append is fsynced before its callback fires. A frame cut short
//! by a crash was never acknowledged, so a torn tail is treated as the end
//! of the segment; a complete frame with a bad checksum is corruption.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crc32fast::Hasher;
use tracing::debug;

use super::errors::{CheckpointError, CheckpointResult};
use super::marker::{ledger_path, marker_path, parse_marker_name, LedgerMarker};
use super::store::{
    entry_range, AppendCallback, DigestType, EntryId, LedgerHandle, LedgerId, LedgerOptions,
    LogStore,
};

const FRAME_HEADER_LEN: usize = 8;

fn checksum(digest: DigestType, password: &[u8], bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    if digest == DigestType::Mac {
        hasher.update(password);
    }
    hasher.update(bytes);
    hasher.finalize()
}

struct OpenLedger {
    marker: LedgerMarker,
    password: Vec<u8>,
    entries: u64,
}

struct FileState {
    next_id: LedgerId,
    ledgers: HashMap<LedgerId, OpenLedger>,
}

/// Log store persisting segments under one directory.
pub struct FileLogStore {
    dir: PathBuf,
    state: Mutex<FileState>,
}

impl std::fmt::Debug for FileLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileLogStore").field("dir", &self.dir).finish()
    }
}

impl FileLogStore {
    /// Open (creating if needed) the store rooted at `dir`.
    pub fn open_dir(dir: &Path) -> CheckpointResult<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            CheckpointError::io(
                format!("failed to create store directory: {}", dir.display()),
                e,
            )
        })?;

        let mut max_id = 0;
        let listing = fs::read_dir(dir).map_err(|e| {
            CheckpointError::io(format!("failed to list store directory: {}", dir.display()), e)
        })?;
        for entry in listing {
            let entry = entry.map_err(|e| {
                CheckpointError::io(format!("failed to list store directory: {}", dir.display()), e)
            })?;
            if let Some(id) = entry.file_name().to_str().and_then(parse_marker_name) {
                max_id = max_id.max(id);
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(FileState {
                next_id: max_id + 1,
                ledgers: HashMap::new(),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> MutexGuard<'_, FileState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every checksummed frame in the segment file.
    fn read_frames(&self, id: LedgerId, ledger: &OpenLedger) -> CheckpointResult<Vec<Vec<u8>>> {
        let path = ledger_path(&self.dir, id);
        let data = fs::read(&path).map_err(|e| {
            CheckpointError::io(format!("failed to read ledger: {}", path.display()), e)
        })?;

        let mut frames = Vec::new();
        let mut offset = 0;
        while data.len() - offset >= FRAME_HEADER_LEN {
            let len = u32::from_le_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]) as usize;
            let expected = u32::from_le_bytes([
                data[offset + 4],
                data[offset + 5],
                data[offset + 6],
                data[offset + 7],
            ]);
            let start = offset + FRAME_HEADER_LEN;
            if data.len() - start < len {
                debug!(ledger = id, offset, "ignoring torn tail");
                break;
            }
            let bytes = &data[start..start + len];
            if checksum(ledger.marker.digest, &ledger.password, bytes) != expected {
                return Err(CheckpointError::corruption(format!(
                    "ledger {} entry {}: checksum mismatch",
                    id,
                    frames.len()
                )));
            }
            frames.push(bytes.to_vec());
            offset = start + len;
        }
        Ok(frames)
    }

    fn append_frame(
        &self,
        id: LedgerId,
        ledger: &mut OpenLedger,
        bytes: &[u8],
    ) -> CheckpointResult<EntryId> {
        if ledger.marker.sealed {
            return Err(CheckpointError::ledger_sealed(id));
        }
        let len = u32::try_from(bytes.len()).map_err(|_| {
            CheckpointError::log_store(format!(
                "ledger {}: entry of {} bytes too large",
                id,
                bytes.len()
            ))
        })?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + bytes.len());
        frame.extend_from_slice(&len.to_le_bytes());
        let sum = checksum(ledger.marker.digest, &ledger.password, bytes);
        frame.extend_from_slice(&sum.to_le_bytes());
        frame.extend_from_slice(bytes);

        let path = ledger_path(&self.dir, id);
        let mut file = OpenOptions::new().append(true).open(&path).map_err(|e| {
            CheckpointError::io(format!("failed to open ledger: {}", path.display()), e)
        })?;
        file.write_all(&frame).map_err(|e| {
            CheckpointError::io(format!("failed to append to ledger: {}", path.display()), e)
        })?;
        file.sync_all().map_err(|e| {
            CheckpointError::io(format!("failed to fsync ledger: {}", path.display()), e)
        })?;

        ledger.entries += 1;
        Ok(ledger.entries - 1)
    }
}

impl LogStore for FileLogStore {
    fn create(&self, options: &LedgerOptions) -> CheckpointResult<LedgerHandle> {
        let mut state = self.lock();
        let id = state.next_id;

        let path = ledger_path(&self.dir, id);
        let file = File::create(&path).map_err(|e| {
            CheckpointError::io(format!("failed to create ledger: {}", path.display()), e)
        })?;
        file.sync_all().map_err(|e| {
            CheckpointError::io(format!("failed to fsync ledger: {}", path.display()), e)
        })?;

        let marker = LedgerMarker::new(id, options);
        marker.write_to_file(&marker_path(&self.dir, id))?;

        state.next_id += 1;
        state.ledgers.insert(
            id,
            OpenLedger {
                marker,
                password: options.password.clone(),
                entries: 0,
            },
        );
        debug!(ledger = id, dir = %self.dir.display(), "ledger created");
        Ok(LedgerHandle::new(id))
    }

    fn open(&self, id: LedgerId, password: &[u8]) -> CheckpointResult<LedgerHandle> {
        let mut state = self.lock();
        if let Some(ledger) = state.ledgers.get(&id) {
            if ledger.password != password {
                return Err(CheckpointError::bad_password(id));
            }
            return Ok(LedgerHandle::new(id));
        }

        let path = marker_path(&self.dir, id);
        if !path.exists() {
            return Err(CheckpointError::ledger_not_found(id));
        }
        let marker = LedgerMarker::read_from_file(&path)?;
        if !marker.password_matches(password) {
            return Err(CheckpointError::bad_password(id));
        }

        let mut ledger = OpenLedger {
            marker,
            password: password.to_vec(),
            entries: 0,
        };
        ledger.entries = self.read_frames(id, &ledger)?.len() as u64;
        state.ledgers.insert(id, ledger);
        Ok(LedgerHandle::new(id))
    }

    fn append(&self, handle: &LedgerHandle, bytes: Vec<u8>, on_durable: AppendCallback) {
        let result = {
            let mut state = self.lock();
            match state.ledgers.get_mut(&handle.id()) {
                Some(ledger) => self.append_frame(handle.id(), ledger, &bytes),
                None => Err(CheckpointError::ledger_not_found(handle.id())),
            }
        };
        on_durable(result);
    }

    fn close(&self, handle: &LedgerHandle) -> CheckpointResult<()> {
        let mut state = self.lock();
        let ledger = state
            .ledgers
            .get_mut(&handle.id())
            .ok_or_else(|| CheckpointError::ledger_not_found(handle.id()))?;
        if ledger.marker.sealed {
            return Ok(());
        }
        let mut marker = ledger.marker.clone();
        marker.sealed = true;
        marker.write_to_file(&marker_path(&self.dir, handle.id()))?;
        ledger.marker = marker;
        debug!(ledger = handle.id(), entries = ledger.entries, "ledger sealed");
        Ok(())
    }

    fn read_entries(
        &self,
        handle: &LedgerHandle,
        first: EntryId,
        last: EntryId,
    ) -> CheckpointResult<Vec<Vec<u8>>> {
        let state = self.lock();
        let ledger = state
            .ledgers
            .get(&handle.id())
            .ok_or_else(|| CheckpointError::ledger_not_found(handle.id()))?;
        let frames = self.read_frames(handle.id(), ledger)?;
        entry_range(handle.id(), &frames, first, last)
    }

    fn last_confirmed(&self, handle: &LedgerHandle) -> CheckpointResult<Option<EntryId>> {
        let state = self.lock();
        let ledger = state
            .ledgers
            .get(&handle.id())
            .ok_or_else(|| CheckpointError::ledger_not_found(handle.id()))?;
        Ok(ledger.entries.checked_sub(1))
    }
}
