//! Fan-out of finished ledger records to external observers.
//!
//! Subscribers are notified synchronously, in subscription order, on every
//! append and commit. A non-lazy subscriber first receives a replay of the
//! existing ledger so it never observes a gap.

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::record::DiffRecord;

/// Why a listener is being invoked for a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffNotification {
    /// A freshly appended record.
    Append,
    /// An existing record replayed to bring a subscriber up to date.
    Replay,
    /// The synthesized record at index 0 produced by a commit.
    Commit,
}

/// Handle identifying one diff listener subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type DiffListener = Box<dyn FnMut(&DiffRecord, DiffNotification) + Send>;

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    subscribers: IndexMap<u64, std::sync::Arc<Mutex<DiffListener>>>,
}

impl ListenerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Unless `lazy`, the existing ledger is replayed to
    /// it immediately, before any future record.
    pub(crate) fn subscribe(
        &self,
        callback: DiffListener,
        lazy: bool,
        existing: &[DiffRecord],
    ) -> ListenerId {
        let callback = std::sync::Arc::new(Mutex::new(callback));
        let id = {
            let mut st = self.state.lock();
            let id = st.next_id;
            st.next_id += 1;
            st.subscribers.insert(id, std::sync::Arc::clone(&callback));
            ListenerId(id)
        };
        if !lazy {
            let mut callback = callback.lock();
            for record in existing {
                (*callback)(record, DiffNotification::Replay);
            }
        }
        id
    }

    pub(crate) fn unsubscribe(&self, id: ListenerId) -> bool {
        self.state.lock().subscribers.shift_remove(&id.0).is_some()
    }

    pub(crate) fn notify_append(&self, record: &DiffRecord) {
        for callback in self.current_subscribers() {
            (*callback.lock())(record, DiffNotification::Append);
        }
    }

    /// Re-notify the whole resulting ledger after a commit; index 0 is the
    /// synthesized record and is marked distinctly.
    pub(crate) fn notify_commit(&self, resulting: &[DiffRecord]) {
        for callback in self.current_subscribers() {
            let mut callback = callback.lock();
            for (index, record) in resulting.iter().enumerate() {
                let kind = if index == 0 {
                    DiffNotification::Commit
                } else {
                    DiffNotification::Replay
                };
                (*callback)(record, kind);
            }
        }
    }

    /// Snapshot of the subscriber list so callbacks run without the registry
    /// lock held; a callback may subscribe or unsubscribe mid-notification.
    fn current_subscribers(&self) -> Vec<std::sync::Arc<Mutex<DiffListener>>> {
        self.state
            .lock()
            .subscribers
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DiffRecord;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(reason: &str) -> DiffRecord {
        DiffRecord::system(reason.to_owned(), None)
    }

    #[test]
    fn non_lazy_subscriber_replays_existing_records() {
        let registry = ListenerRegistry::new();
        let existing = vec![record("one"), record("two")];
        let replayed = Arc::new(AtomicUsize::new(0));
        let replayed_clone = replayed.clone();
        registry.subscribe(
            Box::new(move |_, kind| {
                assert_eq!(kind, DiffNotification::Replay);
                replayed_clone.fetch_add(1, Ordering::Relaxed);
            }),
            false,
            &existing,
        );
        assert_eq!(replayed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn lazy_subscriber_skips_replay() {
        let registry = ListenerRegistry::new();
        let existing = vec![record("one")];
        let called = Arc::new(AtomicUsize::new(0));
        let called_clone = called.clone();
        registry.subscribe(
            Box::new(move |_, _| {
                called_clone.fetch_add(1, Ordering::Relaxed);
            }),
            true,
            &existing,
        );
        assert_eq!(called.load(Ordering::Relaxed), 0);

        registry.notify_append(&record("new"));
        assert_eq!(called.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unsubscribed_listener_stops_receiving() {
        let registry = ListenerRegistry::new();
        let called = Arc::new(AtomicUsize::new(0));
        let called_clone = called.clone();
        let id = registry.subscribe(
            Box::new(move |_, _| {
                called_clone.fetch_add(1, Ordering::Relaxed);
            }),
            true,
            &[],
        );
        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        registry.notify_append(&record("after"));
        assert_eq!(called.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn commit_marks_index_zero_distinctly() {
        let registry = ListenerRegistry::new();
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let kinds_clone = kinds.clone();
        registry.subscribe(
            Box::new(move |_, kind| kinds_clone.lock().push(kind)),
            true,
            &[],
        );
        registry.notify_commit(&[record("combined"), record("kept")]);
        assert_eq!(
            *kinds.lock(),
            vec![DiffNotification::Commit, DiffNotification::Replay]
        );
    }
}
