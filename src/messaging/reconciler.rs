//! Subscriber set reconciliation
//!
//! Keeps live subscribers in line with the topology the job wants. An
//! unchanged descriptor never touches the transport; live connections are
//! only torn down when their addressing changes or they are no longer
//! wanted.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::errors::MessagingResult;
use super::frame::SubscriptionKey;
use super::subscriber::{Subscriber, SubscriberDescriptor};

/// What reconciling one key did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Unchanged,
    Started,
    Stopped,
    /// Addressing changed; old subscriber stopped, new one started
    Restarted,
    /// Only the replica version moved; connection kept
    VersionUpdated,
}

/// Same subscription apart from its replica version.
fn same_addressing(a: &SubscriberDescriptor, b: &SubscriberDescriptor) -> bool {
    a.key == b.key && a.job_id == b.job_id && a.status_site == b.status_site
}

/// Reconcile a single key.
///
/// `factory` builds an unstarted subscriber; it is only called when a new
/// one must be started.
pub fn reconcile<F>(
    existing: Option<Subscriber>,
    desired: Option<&SubscriberDescriptor>,
    factory: F,
) -> MessagingResult<(Option<Subscriber>, ReconcileAction)>
where
    F: FnOnce(&SubscriberDescriptor) -> Subscriber,
{
    match (existing, desired) {
        (None, None) => Ok((None, ReconcileAction::Unchanged)),
        (Some(mut subscriber), None) => {
            subscriber.stop();
            Ok((None, ReconcileAction::Stopped))
        }
        (None, Some(descriptor)) => {
            let mut subscriber = factory(descriptor);
            subscriber.start()?;
            Ok((Some(subscriber), ReconcileAction::Started))
        }
        (Some(subscriber), Some(descriptor)) if subscriber.descriptor() == descriptor => {
            Ok((Some(subscriber), ReconcileAction::Unchanged))
        }
        (Some(mut subscriber), Some(descriptor))
            if same_addressing(subscriber.descriptor(), descriptor) =>
        {
            subscriber.set_replica_version(descriptor.replica_version);
            Ok((Some(subscriber), ReconcileAction::VersionUpdated))
        }
        (Some(mut subscriber), Some(descriptor)) => {
            subscriber.stop();
            drop(subscriber);
            let mut replacement = factory(descriptor);
            replacement.start()?;
            Ok((Some(replacement), ReconcileAction::Restarted))
        }
    }
}

/// Counts of what one reconcile pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub started: usize,
    pub stopped: usize,
    pub restarted: usize,
    pub version_updated: usize,
    pub unchanged: usize,
}

impl ReconcileSummary {
    fn record(&mut self, action: ReconcileAction) {
        match action {
            ReconcileAction::Unchanged => self.unchanged += 1,
            ReconcileAction::Started => self.started += 1,
            ReconcileAction::Stopped => self.stopped += 1,
            ReconcileAction::Restarted => self.restarted += 1,
            ReconcileAction::VersionUpdated => self.version_updated += 1,
        }
    }

    /// Nothing was started, stopped or updated.
    pub fn is_noop(&self) -> bool {
        self.started == 0 && self.stopped == 0 && self.restarted == 0 && self.version_updated == 0
    }
}

/// Live subscribers of one task, keyed by subscription.
#[derive(Debug, Default)]
pub struct SubscriberSet {
    subscribers: BTreeMap<SubscriptionKey, Subscriber>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the set in line with `desired`.
    ///
    /// Keys are processed in order. If starting a subscriber fails the
    /// error is returned; keys already processed keep their new state and
    /// the failed key has no subscriber.
    pub fn reconcile<F>(
        &mut self,
        desired: &[SubscriberDescriptor],
        mut factory: F,
    ) -> MessagingResult<ReconcileSummary>
    where
        F: FnMut(&SubscriberDescriptor) -> Subscriber,
    {
        let wanted: BTreeMap<&SubscriptionKey, &SubscriberDescriptor> =
            desired.iter().map(|d| (&d.key, d)).collect();
        let keys: BTreeSet<SubscriptionKey> = self
            .subscribers
            .keys()
            .cloned()
            .chain(wanted.keys().map(|k| (*k).clone()))
            .collect();

        let mut summary = ReconcileSummary::default();
        for key in keys {
            let existing = self.subscribers.remove(&key);
            let (subscriber, action) =
                reconcile(existing, wanted.get(&key).copied(), &mut factory)?;
            if let Some(subscriber) = subscriber {
                self.subscribers.insert(key, subscriber);
            }
            summary.record(action);
        }

        if !summary.is_noop() {
            debug!(
                started = summary.started,
                stopped = summary.stopped,
                restarted = summary.restarted,
                version_updated = summary.version_updated,
                unchanged = summary.unchanged,
                "subscriber set reconciled"
            );
        }
        Ok(summary)
    }

    pub fn get(&self, key: &SubscriptionKey) -> Option<&Subscriber> {
        self.subscribers.get(key)
    }

    pub fn get_mut(&mut self, key: &SubscriptionKey) -> Option<&mut Subscriber> {
        self.subscribers.get_mut(key)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Subscriber> {
        self.subscribers.values_mut()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Stop and drop every subscriber.
    pub fn stop_all(&mut self) {
        for subscriber in self.subscribers.values_mut() {
            subscriber.stop();
        }
        self.subscribers.clear();
    }
}
