//! Checkpoint log tests
//!
//! - Playback of a chain ending in a compacted snapshot matches folding the
//!   raw segments
//! - A compaction that loses the registration race changes nothing
//! - Updates queued during a compaction are replayed exactly once
//! - An append in flight when the writer swaps segments still completes
//! - Acknowledged updates survive a restart on the file store
//! - The end-to-end window scenario, including a re-fed update

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use aeroflow::checkpoint::{
    numeric_sum, CheckpointEntry, CheckpointLog, ChainManager, Coordinator, FileLogStore,
    LedgerId, LedgerOptions, LogStore, MemoryCoordinator, MemoryLogStore, PlaybackEngine,
    TaskSlot, TransitionOutcome, WindowAggregations, WindowState, WindowUpdate,
};
use aeroflow::config::CheckpointConfig;
use aeroflow::observability::MetricsRegistry;
use serde_json::json;
use tempfile::TempDir;
use uuid::Uuid;

// =============================================================================
// Test Utilities
// =============================================================================

const PASSWORD: &str = "pw";

fn slot() -> TaskSlot {
    TaskSlot::new("job-1", "window-task", 0)
}

fn config() -> CheckpointConfig {
    CheckpointConfig {
        write_batch_timeout_ms: 5,
        segment_id_backoff_ms: 1,
        ledger_password: PASSWORD.to_string(),
        ..CheckpointConfig::default()
    }
}

fn sums() -> WindowAggregations {
    WindowAggregations::new().register("W", false, numeric_sum)
}

fn update(id: &str, value: i64) -> WindowUpdate {
    WindowUpdate::new("W", 0, json!(value)).with_dedup_id(id)
}

fn plain(value: i64) -> WindowUpdate {
    WindowUpdate::new("W", 0, json!(value))
}

fn open_log_with(
    store: Arc<dyn LogStore>,
    coordinator: Arc<dyn Coordinator>,
    config: &CheckpointConfig,
) -> CheckpointLog {
    CheckpointLog::open(
        slot(),
        Uuid::from_u128(9),
        store,
        coordinator,
        config,
        sums(),
        Arc::new(MetricsRegistry::new()),
    )
    .expect("checkpoint log opens")
}

/// Record without waiting; the receiver yields the durability result.
fn record_async(
    log: &CheckpointLog,
    updates: Vec<WindowUpdate>,
) -> mpsc::Receiver<aeroflow::checkpoint::CheckpointResult<()>> {
    let (tx, rx) = mpsc::channel();
    log.record(updates, Box::new(move |r| tx.send(r).unwrap()))
        .unwrap();
    rx
}

fn open_log(store: Arc<dyn LogStore>, coordinator: Arc<dyn Coordinator>) -> CheckpointLog {
    CheckpointLog::open(
        slot(),
        Uuid::from_u128(9),
        store,
        coordinator,
        &config(),
        sums(),
        Arc::new(MetricsRegistry::new()),
    )
    .expect("checkpoint log opens")
}

/// Record and wait for durability.
fn record(log: &CheckpointLog, updates: Vec<WindowUpdate>) -> usize {
    let (tx, rx) = mpsc::channel();
    let applied = log
        .record(updates, Box::new(move |r| tx.send(r).unwrap()))
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    applied
}

fn write_segment(store: &dyn LogStore, entries: Vec<CheckpointEntry>) -> LedgerId {
    let handle = store
        .create(&LedgerOptions {
            password: PASSWORD.as_bytes().to_vec(),
            ..LedgerOptions::default()
        })
        .unwrap();
    for entry in entries {
        let (tx, rx) = mpsc::channel();
        store.append(
            &handle,
            entry.encode().unwrap(),
            Box::new(move |r| tx.send(r).unwrap()),
        );
        rx.recv().unwrap().unwrap();
    }
    store.close(&handle).unwrap();
    handle.id()
}

fn replay(store: Arc<dyn LogStore>, chain: &[LedgerId]) -> WindowState {
    PlaybackEngine::new(store, sums(), 4, PASSWORD)
        .replay(chain, WindowState::new())
        .unwrap()
        .0
}

fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

// =============================================================================
// Playback
// =============================================================================

#[test]
fn test_compacted_snapshot_replays_like_raw_segments() {
    let store: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
    let a = write_segment(
        store.as_ref(),
        vec![CheckpointEntry::Batch(vec![update("m1", 1), update("m2", 2)])],
    );
    let b = write_segment(
        store.as_ref(),
        vec![CheckpointEntry::Batch(vec![update("m3", 4)])],
    );
    let folded = replay(Arc::clone(&store), &[a, b]);

    let c = write_segment(
        store.as_ref(),
        vec![CheckpointEntry::Compacted(folded.to_compacted())],
    );
    let compacted = replay(Arc::clone(&store), &[a, b, c]);
    assert_eq!(compacted, folded);
    assert_eq!(compacted.extent("W", 0, None), Some(&json!(7)));

    // the snapshot wins over whatever precedes it
    let bogus = write_segment(
        store.as_ref(),
        vec![CheckpointEntry::Batch(vec![update("x", 100)])],
    );
    assert_eq!(replay(Arc::clone(&store), &[bogus, c]), folded);
}

#[test]
fn test_compaction_keeps_replayed_state_stable() {
    let memory = Arc::new(MemoryLogStore::new());
    let coordinator = Arc::new(MemoryCoordinator::new());
    let log = open_log(
        Arc::clone(&memory) as Arc<dyn LogStore>,
        Arc::clone(&coordinator) as Arc<dyn Coordinator>,
    );

    record(&log, vec![update("m1", 1)]);
    record(&log, vec![update("m2", 2)]);
    let before = coordinator.registered_chain(&slot()).unwrap();
    assert_eq!(before, vec![1]);
    let expected = replay(memory.clone(), &before);

    log.request_compaction().unwrap().unwrap().join().unwrap().unwrap();
    wait_until(|| coordinator.registered_chain(&slot()).unwrap().len() == 2
        && log.chain().active_id() == 2
        && coordinator.registered_chain(&slot()).unwrap()[0] != 1);

    let after = coordinator.registered_chain(&slot()).unwrap();
    assert_eq!(after[1], 2);
    assert_eq!(replay(memory.clone(), &after), expected);

    record(&log, vec![update("m3", 4)]);
    let chain = coordinator.registered_chain(&slot()).unwrap();
    let state = replay(memory.clone(), &chain);
    assert_eq!(state.extent("W", 0, None), Some(&json!(7)));
    assert_eq!(state, log.state().current());
    log.shutdown().unwrap();
}

// =============================================================================
// Compaction safety
// =============================================================================

#[test]
fn test_mismatched_chain_leaves_writer_in_place() {
    let store = Arc::new(MemoryLogStore::new());
    let coordinator = Arc::new(MemoryCoordinator::new());
    let metrics = Arc::new(MetricsRegistry::new());
    let manager = ChainManager::start(
        slot(),
        Uuid::from_u128(9),
        Arc::clone(&store) as Arc<dyn LogStore>,
        Arc::clone(&coordinator) as Arc<dyn Coordinator>,
        &config(),
        Arc::clone(&metrics),
    )
    .unwrap();
    let state = aeroflow::checkpoint::SharedWindowState::default();

    manager.request_compaction().unwrap().unwrap().join().unwrap().unwrap();
    // another peer registered a segment after ours
    coordinator.set_chain(&slot(), vec![1, 2, 40]);

    let outcome = manager.transition(&state);
    assert!(matches!(outcome, TransitionOutcome::Aborted { pending: 2 }));
    assert_eq!(manager.active_id(), 1);
    assert!(!store.is_sealed(1));
    assert_eq!(coordinator.registered_chain(&slot()).unwrap(), vec![1, 2, 40]);
    assert_eq!(metrics.snapshot().compactions_aborted, 1);

    // a later attempt proceeds once the chain settles
    coordinator.set_chain(&slot(), vec![1]);
    manager.request_compaction().unwrap().unwrap().join().unwrap().unwrap();
    assert!(matches!(
        manager.transition(&state),
        TransitionOutcome::Swapped { .. }
    ));
}

#[test]
fn test_compaction_with_queued_updates_replays_live_state() {
    let memory = Arc::new(MemoryLogStore::new());
    let coordinator = Arc::new(MemoryCoordinator::new());
    let log = open_log_with(
        Arc::clone(&memory) as Arc<dyn LogStore>,
        Arc::clone(&coordinator) as Arc<dyn Coordinator>,
        &CheckpointConfig {
            write_batch_size: 1,
            ..config()
        },
    );

    memory.hold_appends(true);
    let first = record_async(&log, vec![plain(1)]);
    wait_until(|| memory.held_appends() == 1);
    log.request_compaction().unwrap().unwrap().join().unwrap().unwrap();
    let second = record_async(&log, vec![plain(10)]);
    // both batches plus the snapshot
    wait_until(|| memory.held_appends() == 3);

    memory.hold_appends(false);
    memory.release_appends();
    first.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    second.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    wait_until(|| {
        let chain = coordinator.registered_chain(&slot()).unwrap();
        chain.len() == 2 && chain[0] != 1
    });

    let chain = coordinator.registered_chain(&slot()).unwrap();
    assert_eq!(chain[1], 2);
    let live = log.state().current();
    assert_eq!(live.extent("W", 0, None), Some(&json!(11)));
    assert_eq!(replay(memory.clone(), &chain), live);
    log.shutdown().unwrap();
}

#[test]
fn test_append_in_flight_across_swap_completes() {
    let memory = Arc::new(MemoryLogStore::new());
    let coordinator = Arc::new(MemoryCoordinator::new());
    let log = open_log(
        Arc::clone(&memory) as Arc<dyn LogStore>,
        Arc::clone(&coordinator) as Arc<dyn Coordinator>,
    );

    memory.hold_appends(true);
    let pending = record_async(&log, vec![plain(1)]);
    wait_until(|| memory.held_appends() == 1);
    log.request_compaction().unwrap().unwrap().join().unwrap().unwrap();
    wait_until(|| log.chain().active_id() == 2);
    assert!(!memory.is_sealed(1));

    memory.hold_appends(false);
    memory.release_appends();
    pending.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    wait_until(|| memory.is_sealed(1));
    assert_eq!(memory.entries(1).len(), 1);
    log.shutdown().unwrap();
}

// =============================================================================
// Durability
// =============================================================================

#[test]
fn test_acknowledged_updates_survive_restart() {
    let temp_dir = TempDir::new().unwrap();
    let coordinator = Arc::new(MemoryCoordinator::new());

    {
        let store = Arc::new(FileLogStore::open_dir(temp_dir.path()).unwrap());
        let log = open_log(store, Arc::clone(&coordinator) as Arc<dyn Coordinator>);
        for (i, value) in [3, 4, 5].iter().enumerate() {
            record(&log, vec![update(&format!("m{}", i), *value)]);
        }
        log.shutdown().unwrap();
    }

    let store = Arc::new(FileLogStore::open_dir(temp_dir.path()).unwrap());
    let log = open_log(store, Arc::clone(&coordinator) as Arc<dyn Coordinator>);
    assert_eq!(log.state().current().extent("W", 0, None), Some(&json!(12)));
    assert_eq!(log.playback_stats().updates_applied, 3);
    assert_eq!(coordinator.registered_chain(&slot()).unwrap(), vec![1, 2]);
    log.shutdown().unwrap();
}

// =============================================================================
// End-to-end scenario
// =============================================================================

#[test]
fn test_end_to_end_window_sum_ignores_refed_update() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(FileLogStore::open_dir(temp_dir.path()).unwrap());
    let coordinator = Arc::new(MemoryCoordinator::new());

    let first = write_segment(
        store.as_ref(),
        vec![CheckpointEntry::Batch(vec![update("m1", 1)])],
    );
    let second = write_segment(
        store.as_ref(),
        vec![CheckpointEntry::Batch(vec![update("m2", 1)])],
    );
    coordinator.set_chain(&slot(), vec![first, second]);

    let log = open_log(store, Arc::clone(&coordinator) as Arc<dyn Coordinator>);
    let state = log.state().current();
    assert_eq!(state.extent("W", 0, None), Some(&json!(2)));
    assert!(state.filter.contains("m1"));
    assert!(state.filter.contains("m2"));

    assert_eq!(record(&log, vec![update("m1", 1)]), 0);
    assert_eq!(log.state().current().extent("W", 0, None), Some(&json!(2)));
    log.shutdown().unwrap();
}
