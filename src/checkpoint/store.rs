//! Log store interface
//!
//! Segments ("ledgers") are append-only. `append` does not block on
//! durability: the callback fires once the entry is durable, possibly on
//! another thread and possibly before `append` returns. A closed ledger is
//! sealed and rejects further appends.
//!
//! `MemoryLogStore` keeps everything in process and can hold or fail
//! appends on demand. `FileLogStore` (see `file_store`) persists to disk.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::errors::{CheckpointError, CheckpointResult};

/// Segment identifier
pub type LedgerId = u64;

/// Index of an entry within a segment, starting at 0
pub type EntryId = u64;

/// Checksum applied to stored entries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestType {
    /// Plain CRC32 of the entry
    #[default]
    Crc32,
    /// CRC32 keyed with the ledger password
    Mac,
}

/// Options for creating a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerOptions {
    pub ensemble_size: u32,
    pub quorum_size: u32,
    pub digest: DigestType,
    pub password: Vec<u8>,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            ensemble_size: 1,
            quorum_size: 1,
            digest: DigestType::Crc32,
            password: Vec::new(),
        }
    }
}

/// An open segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerHandle {
    id: LedgerId,
}

impl LedgerHandle {
    pub(crate) fn new(id: LedgerId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> LedgerId {
        self.id
    }
}

/// Called with the entry id once an append is durable, or with the error
/// that prevented it.
pub type AppendCallback = Box<dyn FnOnce(CheckpointResult<EntryId>) + Send>;

/// Append-only segment storage.
pub trait LogStore: Send + Sync {
    fn create(&self, options: &LedgerOptions) -> CheckpointResult<LedgerHandle>;

    /// Open an existing segment for reading.
    fn open(&self, id: LedgerId, password: &[u8]) -> CheckpointResult<LedgerHandle>;

    fn append(&self, handle: &LedgerHandle, bytes: Vec<u8>, on_durable: AppendCallback);

    /// Seal the segment. Closing a sealed segment is a no-op.
    fn close(&self, handle: &LedgerHandle) -> CheckpointResult<()>;

    /// Entries `first..=last`, in write order.
    fn read_entries(
        &self,
        handle: &LedgerHandle,
        first: EntryId,
        last: EntryId,
    ) -> CheckpointResult<Vec<Vec<u8>>>;

    /// Highest durable entry id, `None` for an empty segment.
    fn last_confirmed(&self, handle: &LedgerHandle) -> CheckpointResult<Option<EntryId>>;
}

/// Slice `entries[first..=last]`, rejecting ranges past the end.
pub(crate) fn entry_range(
    id: LedgerId,
    entries: &[Vec<u8>],
    first: EntryId,
    last: EntryId,
) -> CheckpointResult<Vec<Vec<u8>>> {
    if first > last || last >= entries.len() as u64 {
        return Err(CheckpointError::log_store(format!(
            "ledger {}: entries {}..={} outside 0..{}",
            id,
            first,
            last,
            entries.len()
        )));
    }
    Ok(entries[first as usize..=last as usize].to_vec())
}

#[derive(Debug)]
struct MemoryLedger {
    password: Vec<u8>,
    entries: Vec<Vec<u8>>,
    sealed: bool,
}

struct HeldAppend {
    ledger: LedgerId,
    bytes: Vec<u8>,
    on_durable: AppendCallback,
}

#[derive(Default)]
struct MemoryInner {
    next_id: LedgerId,
    ledgers: BTreeMap<LedgerId, MemoryLedger>,
    held: Vec<HeldAppend>,
    hold_appends: bool,
    fail_appends: bool,
}

impl MemoryInner {
    fn commit(&mut self, ledger: LedgerId, bytes: Vec<u8>) -> CheckpointResult<EntryId> {
        if self.fail_appends {
            return Err(CheckpointError::log_store(format!(
                "ledger {}: injected append failure",
                ledger
            )));
        }
        let entry = self
            .ledgers
            .get_mut(&ledger)
            .ok_or_else(|| CheckpointError::ledger_not_found(ledger))?;
        if entry.sealed {
            return Err(CheckpointError::ledger_sealed(ledger));
        }
        entry.entries.push(bytes);
        Ok(entry.entries.len() as u64 - 1)
    }
}

/// In-process log store.
#[derive(Default)]
pub struct MemoryLogStore {
    inner: Mutex<MemoryInner>,
}

impl std::fmt::Debug for MemoryLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLogStore")
            .field("ledgers", &self.ledger_ids())
            .finish()
    }
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue appends instead of completing them until [`release_appends`].
    ///
    /// [`release_appends`]: MemoryLogStore::release_appends
    pub fn hold_appends(&self, hold: bool) {
        self.lock().hold_appends = hold;
    }

    /// Complete every held append in order. Returns how many completed.
    pub fn release_appends(&self) -> usize {
        let completions: Vec<(AppendCallback, CheckpointResult<EntryId>)> = {
            let mut inner = self.lock();
            let held = std::mem::take(&mut inner.held);
            held.into_iter()
                .map(|h| {
                    let result = inner.commit(h.ledger, h.bytes);
                    (h.on_durable, result)
                })
                .collect()
        };
        let count = completions.len();
        for (callback, result) in completions {
            callback(result);
        }
        count
    }

    pub fn held_appends(&self) -> usize {
        self.lock().held.len()
    }

    /// Fail every append until turned off.
    pub fn fail_appends(&self, fail: bool) {
        self.lock().fail_appends = fail;
    }

    pub fn ledger_ids(&self) -> Vec<LedgerId> {
        self.lock().ledgers.keys().copied().collect()
    }

    pub fn is_sealed(&self, id: LedgerId) -> bool {
        self.lock()
            .ledgers
            .get(&id)
            .map(|l| l.sealed)
            .unwrap_or(false)
    }

    /// All entries of a segment.
    pub fn entries(&self, id: LedgerId) -> Vec<Vec<u8>> {
        self.lock()
            .ledgers
            .get(&id)
            .map(|l| l.entries.clone())
            .unwrap_or_default()
    }
}

impl LogStore for MemoryLogStore {
    fn create(&self, options: &LedgerOptions) -> CheckpointResult<LedgerHandle> {
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.ledgers.insert(
            id,
            MemoryLedger {
                password: options.password.clone(),
                entries: Vec::new(),
                sealed: false,
            },
        );
        Ok(LedgerHandle::new(id))
    }

    fn open(&self, id: LedgerId, password: &[u8]) -> CheckpointResult<LedgerHandle> {
        let inner = self.lock();
        let ledger = inner
            .ledgers
            .get(&id)
            .ok_or_else(|| CheckpointError::ledger_not_found(id))?;
        if ledger.password != password {
            return Err(CheckpointError::bad_password(id));
        }
        Ok(LedgerHandle::new(id))
    }

    fn append(&self, handle: &LedgerHandle, bytes: Vec<u8>, on_durable: AppendCallback) {
        let result = {
            let mut inner = self.lock();
            if inner.hold_appends {
                inner.held.push(HeldAppend {
                    ledger: handle.id(),
                    bytes,
                    on_durable,
                });
                return;
            }
            inner.commit(handle.id(), bytes)
        };
        on_durable(result);
    }

    fn close(&self, handle: &LedgerHandle) -> CheckpointResult<()> {
        let mut inner = self.lock();
        let ledger = inner
            .ledgers
            .get_mut(&handle.id())
            .ok_or_else(|| CheckpointError::ledger_not_found(handle.id()))?;
        ledger.sealed = true;
        Ok(())
    }

    fn read_entries(
        &self,
        handle: &LedgerHandle,
        first: EntryId,
        last: EntryId,
    ) -> CheckpointResult<Vec<Vec<u8>>> {
        let inner = self.lock();
        let ledger = inner
            .ledgers
            .get(&handle.id())
            .ok_or_else(|| CheckpointError::ledger_not_found(handle.id()))?;
        entry_range(handle.id(), &ledger.entries, first, last)
    }

    fn last_confirmed(&self, handle: &LedgerHandle) -> CheckpointResult<Option<EntryId>> {
        let inner = self.lock();
        let ledger = inner
            .ledgers
            .get(&handle.id())
            .ok_or_else(|| CheckpointError::ledger_not_found(handle.id()))?;
        Ok(ledger.entries.len().checked_sub(1).map(|n| n as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn options() -> LedgerOptions {
        LedgerOptions {
            password: b"pw".to_vec(),
            ..LedgerOptions::default()
        }
    }

    fn append_sync(
        store: &MemoryLogStore,
        handle: &LedgerHandle,
        bytes: &[u8],
    ) -> CheckpointResult<EntryId> {
        let (tx, rx) = mpsc::channel();
        store.append(handle, bytes.to_vec(), Box::new(move |r| tx.send(r).unwrap()));
        rx.recv().unwrap()
    }

    #[test]
    fn test_append_read_in_order() {
        let store = MemoryLogStore::new();
        let handle = store.create(&options()).unwrap();
        assert_eq!(store.last_confirmed(&handle).unwrap(), None);

        assert_eq!(append_sync(&store, &handle, b"a").unwrap(), 0);
        assert_eq!(append_sync(&store, &handle, b"b").unwrap(), 1);

        assert_eq!(store.last_confirmed(&handle).unwrap(), Some(1));
        assert_eq!(
            store.read_entries(&handle, 0, 1).unwrap(),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
        assert!(store.read_entries(&handle, 1, 2).is_err());
    }

    #[test]
    fn test_sealed_ledger_rejects_append() {
        let store = MemoryLogStore::new();
        let handle = store.create(&options()).unwrap();
        store.close(&handle).unwrap();
        store.close(&handle).unwrap();

        let err = append_sync(&store, &handle, b"late").unwrap_err();
        assert_eq!(err.code(), crate::checkpoint::CheckpointErrorCode::LedgerSealed);
    }

    #[test]
    fn test_open_checks_password() {
        let store = MemoryLogStore::new();
        let handle = store.create(&options()).unwrap();
        assert!(store.open(handle.id(), b"pw").is_ok());
        assert!(store.open(handle.id(), b"wrong").unwrap_err().is_fatal());
        assert!(store.open(99, b"pw").is_err());
    }

    #[test]
    fn test_held_appends_complete_on_release() {
        let store = MemoryLogStore::new();
        let handle = store.create(&options()).unwrap();
        store.hold_appends(true);

        let (tx, rx) = mpsc::channel();
        store.append(&handle, b"x".to_vec(), Box::new(move |r| tx.send(r).unwrap()));
        assert!(rx.try_recv().is_err());
        assert_eq!(store.last_confirmed(&handle).unwrap(), None);

        assert_eq!(store.release_appends(), 1);
        assert_eq!(rx.recv().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_injected_failure_reported() {
        let store = MemoryLogStore::new();
        let handle = store.create(&options()).unwrap();
        store.fail_appends(true);
        assert!(append_sync(&store, &handle, b"x").is_err());
        store.fail_appends(false);
        assert_eq!(append_sync(&store, &handle, b"y").unwrap(), 0);
    }
}
