//! Window state persisted by the checkpoint log
//!
//! The log does not interpret aggregates. It folds update records through
//! the per-window functions the task registers, keyed by window, extent
//! and (for grouped tasks) group key, and keeps a filter of dedup ids so a
//! re-fed update is applied once.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{CheckpointError, CheckpointResult};

/// Window identifier
pub type WindowId = String;

/// One windowing update as written to a `Batch` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowUpdate {
    pub window_id: WindowId,
    pub extent: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_id: Option<String>,
    pub value: Value,
}

impl WindowUpdate {
    pub fn new(window_id: impl Into<WindowId>, extent: u64, value: Value) -> Self {
        Self {
            window_id: window_id.into(),
            extent,
            group_key: None,
            dedup_id: None,
            value,
        }
    }

    pub fn with_group(mut self, group_key: impl Into<String>) -> Self {
        self.group_key = Some(group_key.into());
        self
    }

    pub fn with_dedup_id(mut self, dedup_id: impl Into<String>) -> Self {
        self.dedup_id = Some(dedup_id.into());
        self
    }
}

/// Extent within a window, optionally split by group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExtentKey {
    pub extent: u64,
    pub group: Option<String>,
}

/// Dedup ids seen so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupFilter {
    seen: BTreeSet<String>,
}

impl DedupFilter {
    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Returns `false` if `id` was already present.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        self.seen.insert(id.into())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Sorted ids, for a compacted snapshot.
    pub fn snapshot(&self) -> Vec<String> {
        self.seen.iter().cloned().collect()
    }

    pub fn restore(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            seen: ids.into_iter().collect(),
        }
    }
}

/// Per-window update function: `(current aggregate, update value) -> new aggregate`.
pub type AggregateFn = Arc<dyn Fn(Option<&Value>, &Value) -> Value + Send + Sync>;

#[derive(Clone)]
struct Aggregation {
    update: AggregateFn,
    grouped: bool,
}

/// Update functions registered by the task, by window id.
#[derive(Clone, Default)]
pub struct WindowAggregations {
    windows: HashMap<WindowId, Aggregation>,
    fallback: Option<Aggregation>,
}

impl fmt::Debug for WindowAggregations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.windows.keys().collect();
        ids.sort();
        f.debug_struct("WindowAggregations")
            .field("windows", &ids)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl WindowAggregations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `update` for `window_id`. A grouped window keys extents by
    /// the update's group key as well.
    pub fn register<F>(mut self, window_id: impl Into<WindowId>, grouped: bool, update: F) -> Self
    where
        F: Fn(Option<&Value>, &Value) -> Value + Send + Sync + 'static,
    {
        self.windows.insert(
            window_id.into(),
            Aggregation {
                update: Arc::new(update),
                grouped,
            },
        );
        self
    }

    /// Function used for windows with no specific registration.
    pub fn with_fallback<F>(mut self, grouped: bool, update: F) -> Self
    where
        F: Fn(Option<&Value>, &Value) -> Value + Send + Sync + 'static,
    {
        self.fallback = Some(Aggregation {
            update: Arc::new(update),
            grouped,
        });
        self
    }

    fn get(&self, window_id: &str) -> Option<&Aggregation> {
        self.windows.get(window_id).or(self.fallback.as_ref())
    }
}

/// Numeric sum, keeping integers integral.
pub fn numeric_sum(current: Option<&Value>, update: &Value) -> Value {
    let current = current.cloned().unwrap_or(Value::from(0));
    match (current.as_i64(), update.as_i64()) {
        (Some(a), Some(b)) => Value::from(a.saturating_add(b)),
        _ => {
            let a = current.as_f64().unwrap_or(0.0);
            let b = update.as_f64().unwrap_or(0.0);
            Value::from(a + b)
        }
    }
}

/// One extent of a compacted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtentRecord {
    pub window_id: WindowId,
    pub extent: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_key: Option<String>,
    pub value: Value,
}

/// Full point-in-time state: extents plus filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactedState {
    pub filter: Vec<String>,
    pub extents: Vec<ExtentRecord>,
}

/// In-memory window state owned by a task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowState {
    pub state: BTreeMap<WindowId, BTreeMap<ExtentKey, Value>>,
    pub filter: DedupFilter,
}

impl WindowState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one update.
    ///
    /// Returns `Ok(false)` when the update's dedup id was already seen and
    /// nothing changed.
    pub fn apply_update(
        &mut self,
        update: &WindowUpdate,
        aggregations: &WindowAggregations,
    ) -> CheckpointResult<bool> {
        if let Some(id) = &update.dedup_id {
            if self.filter.contains(id) {
                return Ok(false);
            }
        }

        let aggregation = aggregations
            .get(&update.window_id)
            .ok_or_else(|| CheckpointError::unknown_window(&update.window_id))?;
        let key = ExtentKey {
            extent: update.extent,
            group: if aggregation.grouped {
                update.group_key.clone()
            } else {
                None
            },
        };

        let extents = self.state.entry(update.window_id.clone()).or_default();
        let next = (aggregation.update)(extents.get(&key), &update.value);
        extents.insert(key, next);

        if let Some(id) = &update.dedup_id {
            self.filter.insert(id.clone());
        }
        Ok(true)
    }

    /// Whether `update` would change the state: its window is known and its
    /// dedup id, if any, has not been seen.
    pub fn admits(
        &self,
        update: &WindowUpdate,
        aggregations: &WindowAggregations,
    ) -> CheckpointResult<bool> {
        if aggregations.get(&update.window_id).is_none() {
            return Err(CheckpointError::unknown_window(&update.window_id));
        }
        Ok(update
            .dedup_id
            .as_ref()
            .map_or(true, |id| !self.filter.contains(id)))
    }

    /// Aggregate for `(window, extent[, group])`.
    pub fn extent(&self, window_id: &str, extent: u64, group: Option<&str>) -> Option<&Value> {
        let key = ExtentKey {
            extent,
            group: group.map(str::to_string),
        };
        self.state.get(window_id)?.get(&key)
    }

    pub fn to_compacted(&self) -> CompactedState {
        let extents = self
            .state
            .iter()
            .flat_map(|(window_id, extents)| {
                extents.iter().map(move |(key, value)| ExtentRecord {
                    window_id: window_id.clone(),
                    extent: key.extent,
                    group_key: key.group.clone(),
                    value: value.clone(),
                })
            })
            .collect();
        CompactedState {
            filter: self.filter.snapshot(),
            extents,
        }
    }

    /// Rebuild from a snapshot, discarding nothing from it.
    pub fn from_compacted(compacted: &CompactedState) -> Self {
        let mut state: BTreeMap<WindowId, BTreeMap<ExtentKey, Value>> = BTreeMap::new();
        for record in &compacted.extents {
            state.entry(record.window_id.clone()).or_default().insert(
                ExtentKey {
                    extent: record.extent,
                    group: record.group_key.clone(),
                },
                record.value.clone(),
            );
        }
        Self {
            state,
            filter: DedupFilter::restore(compacted.filter.iter().cloned()),
        }
    }
}

/// Read access to the task's window state for compaction snapshots.
pub trait StateSnapshotSource: Send + Sync {
    fn snapshot(&self) -> CompactedState;
}

impl StateSnapshotSource for WindowState {
    fn snapshot(&self) -> CompactedState {
        self.to_compacted()
    }
}

/// Window state shared between the task and the checkpoint log.
#[derive(Debug, Clone, Default)]
pub struct SharedWindowState {
    inner: Arc<RwLock<WindowState>>,
}

impl SharedWindowState {
    pub fn new(state: WindowState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    pub fn apply_update(
        &self,
        update: &WindowUpdate,
        aggregations: &WindowAggregations,
    ) -> CheckpointResult<bool> {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .apply_update(update, aggregations)
    }

    /// Exclusive access, held while a change is handed to the writer.
    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, WindowState> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Clone of the current state.
    pub fn current(&self) -> WindowState {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn replace(&self, state: WindowState) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

impl StateSnapshotSource for SharedWindowState {
    fn snapshot(&self) -> CompactedState {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .to_compacted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sums() -> WindowAggregations {
        WindowAggregations::new()
            .register("w", false, numeric_sum)
            .register("g", true, numeric_sum)
    }

    #[test]
    fn test_fold_sums_per_extent() {
        let mut state = WindowState::new();
        let aggs = sums();
        state.apply_update(&WindowUpdate::new("w", 0, json!(1)), &aggs).unwrap();
        state.apply_update(&WindowUpdate::new("w", 0, json!(2)), &aggs).unwrap();
        state.apply_update(&WindowUpdate::new("w", 1, json!(5)), &aggs).unwrap();

        assert_eq!(state.extent("w", 0, None), Some(&json!(3)));
        assert_eq!(state.extent("w", 1, None), Some(&json!(5)));
    }

    #[test]
    fn test_dedup_id_applied_once() {
        let mut state = WindowState::new();
        let aggs = sums();
        let update = WindowUpdate::new("w", 0, json!(1)).with_dedup_id("m1");

        assert!(state.apply_update(&update, &aggs).unwrap());
        assert!(!state.apply_update(&update, &aggs).unwrap());
        assert_eq!(state.extent("w", 0, None), Some(&json!(1)));
        assert!(state.filter.contains("m1"));
    }

    #[test]
    fn test_grouped_window_splits_by_group() {
        let mut state = WindowState::new();
        let aggs = sums();
        state
            .apply_update(&WindowUpdate::new("g", 0, json!(1)).with_group("a"), &aggs)
            .unwrap();
        state
            .apply_update(&WindowUpdate::new("g", 0, json!(2)).with_group("b"), &aggs)
            .unwrap();
        // ungrouped window ignores the group key
        state
            .apply_update(&WindowUpdate::new("w", 0, json!(4)).with_group("a"), &aggs)
            .unwrap();

        assert_eq!(state.extent("g", 0, Some("a")), Some(&json!(1)));
        assert_eq!(state.extent("g", 0, Some("b")), Some(&json!(2)));
        assert_eq!(state.extent("w", 0, None), Some(&json!(4)));
    }

    #[test]
    fn test_unknown_window_rejected() {
        let mut state = WindowState::new();
        let err = state
            .apply_update(&WindowUpdate::new("nope", 0, json!(1)), &sums())
            .unwrap_err();
        assert_eq!(err.code(), crate::checkpoint::CheckpointErrorCode::UnknownWindow);
    }

    #[test]
    fn test_fallback_aggregation() {
        let mut state = WindowState::new();
        let aggs = WindowAggregations::new().with_fallback(false, numeric_sum);
        state.apply_update(&WindowUpdate::new("any", 2, json!(1.5)), &aggs).unwrap();
        state.apply_update(&WindowUpdate::new("any", 2, json!(1)), &aggs).unwrap();
        assert_eq!(state.extent("any", 2, None), Some(&json!(2.5)));
    }

    #[test]
    fn test_compacted_snapshot_restores_state() {
        let mut state = WindowState::new();
        let aggs = sums();
        state
            .apply_update(&WindowUpdate::new("w", 0, json!(2)).with_dedup_id("m1"), &aggs)
            .unwrap();
        state
            .apply_update(&WindowUpdate::new("g", 3, json!(7)).with_group("k"), &aggs)
            .unwrap();

        let restored = WindowState::from_compacted(&state.to_compacted());
        assert_eq!(restored, state);
    }

    #[test]
    fn test_shared_state_snapshot() {
        let shared = SharedWindowState::default();
        shared
            .apply_update(&WindowUpdate::new("w", 0, json!(1)), &sums())
            .unwrap();
        let snapshot = shared.snapshot();
        assert_eq!(snapshot.extents.len(), 1);
        assert_eq!(snapshot.extents[0].value, json!(1));
    }
}
