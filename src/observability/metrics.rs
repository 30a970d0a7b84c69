//! Metrics registry for aeroflow
//!
//! Counters only. Monotonic, reset only on process start.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Operational counters shared by subscribers, the batch writer and
/// playback.
///
/// All counters use Relaxed ordering; readers only need eventual values.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    /// Messages accepted by a ticket and handed to the task
    messages_accepted: AtomicU64,
    /// Redelivered messages dropped by a ticket
    duplicates_dropped: AtomicU64,
    /// Barriers aligned by handlers
    barriers_aligned: AtomicU64,
    /// Subscriptions torn down for a protocol violation
    protocol_violations: AtomicU64,
    /// Status frames the transport refused
    status_offers_failed: AtomicU64,
    /// Batches durably appended by the writer
    batches_written: AtomicU64,
    /// Window updates carried by those batches
    updates_written: AtomicU64,
    /// Bytes appended to segments
    bytes_written: AtomicU64,
    /// Compaction snapshots written
    compactions_completed: AtomicU64,
    /// Compaction transitions abandoned after a chain race
    compactions_aborted: AtomicU64,
    /// Entries folded during playback
    playback_entries: AtomicU64,
}

impl MetricsRegistry {
    /// Create a new metrics registry with all counters at zero
    pub fn new() -> Self {
        Self::default()
    }

    // Messaging

    pub fn add_messages_accepted(&self, count: u64) {
        self.messages_accepted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_duplicates_dropped(&self, count: u64) {
        self.duplicates_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_barriers_aligned(&self) {
        self.barriers_aligned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_protocol_violations(&self) {
        self.protocol_violations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_status_offers_failed(&self) {
        self.status_offers_failed.fetch_add(1, Ordering::Relaxed);
    }

    // Checkpoint log

    /// Record one durably appended batch
    pub fn record_batch_written(&self, updates: u64, bytes: u64) {
        self.batches_written.fetch_add(1, Ordering::Relaxed);
        self.updates_written.fetch_add(updates, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn increment_compactions_completed(&self) {
        self.compactions_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_compactions_aborted(&self) {
        self.compactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_playback_entries(&self, count: u64) {
        self.playback_entries.fetch_add(count, Ordering::Relaxed);
    }

    /// Current values as JSON
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.snapshot()).unwrap_or_else(|_| "{}".to_string())
    }

    /// Get all metrics as a snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_accepted: self.messages_accepted.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            barriers_aligned: self.barriers_aligned.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            status_offers_failed: self.status_offers_failed.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            updates_written: self.updates_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            compactions_completed: self.compactions_completed.load(Ordering::Relaxed),
            compactions_aborted: self.compactions_aborted.load(Ordering::Relaxed),
            playback_entries: self.playback_entries.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub messages_accepted: u64,
    pub duplicates_dropped: u64,
    pub barriers_aligned: u64,
    pub protocol_violations: u64,
    pub status_offers_failed: u64,
    pub batches_written: u64,
    pub updates_written: u64,
    pub bytes_written: u64,
    pub compactions_completed: u64,
    pub compactions_aborted: u64,
    pub playback_entries: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registry_has_zero_values() {
        let registry = MetricsRegistry::new();
        assert_eq!(registry.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_batch_written_updates_three_counters() {
        let registry = MetricsRegistry::new();

        registry.record_batch_written(3, 120);
        registry.record_batch_written(1, 40);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.batches_written, 2);
        assert_eq!(snapshot.updates_written, 4);
        assert_eq!(snapshot.bytes_written, 160);
    }

    #[test]
    fn test_to_json() {
        let registry = MetricsRegistry::new();
        registry.add_messages_accepted(5);
        registry.add_duplicates_dropped(1);

        let parsed: serde_json::Value = serde_json::from_str(&registry.to_json()).unwrap();
        assert_eq!(parsed["messages_accepted"], 5);
        assert_eq!(parsed["duplicates_dropped"], 1);
    }

    #[test]
    fn test_thread_safety() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(MetricsRegistry::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let reg = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    reg.add_messages_accepted(1);
                    reg.increment_barriers_aligned();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.messages_accepted, 1000);
        assert_eq!(snapshot.barriers_aligned, 1000);
    }
}
