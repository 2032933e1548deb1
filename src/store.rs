//! The store: namespaces, the mutation entry point and the exposed surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::continuation::OnError;
use crate::coordinator::{self, Coordinator, MutationHandle, Outcome};
use crate::delta::diff;
use crate::diagnostics::{Diagnostics, DiagnosticsPort};
use crate::error::{Result, StoreError};
use crate::ledger::{self, Ledger};
use crate::listener::{DiffNotification, ListenerId, ListenerRegistry};
use crate::persist::{self, StorageBackend};
use crate::reactive::ReactiveGraph;
use crate::record::DiffRecord;
use crate::view::StateView;
use crate::watch::{self, FireCause, WatchHandle, WatchOptions, WatchRegistry};

/// Store-wide configuration.
#[derive(Clone)]
pub struct StoreOptions {
    /// Ceiling for nested mutation calls; guards against runaway recursive
    /// watcher triggering.
    pub max_depth: usize,
    /// When set, re-declaring an existing namespace warns and replaces it
    /// instead of failing. Meant for hot-reload style tooling sessions.
    pub devtools: bool,
    /// Capture a backtrace on every history record and unauthorized-write
    /// error. Expensive; opt in only while debugging.
    pub capture_stack: bool,
    /// Record history at all. With diffing off the store still authorizes
    /// writes and drives watchers, but the ledger stays empty.
    pub diffing: bool,
    /// Key-value capability used for namespace persistence.
    pub storage: Option<Arc<dyn StorageBackend>>,
    /// Host hook that receives an inspection handle at construction.
    pub diagnostics: Option<Arc<dyn DiagnosticsPort>>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_depth: 10,
            devtools: false,
            capture_stack: false,
            diffing: true,
            storage: None,
            diagnostics: None,
        }
    }
}

/// Per-namespace configuration for [`Store::create_state`].
#[derive(Clone, Debug, Default)]
pub struct NamespaceOptions {
    /// Persist this namespace through the configured storage backend.
    pub persist: bool,
    /// Override the derived storage key.
    pub persist_key: Option<String>,
}

pub(crate) struct StoreInner {
    pub(crate) options: StoreOptions,
    pub(crate) state: Mutex<IndexMap<String, Value>>,
    pub(crate) graph: ReactiveGraph,
    pub(crate) coord: Coordinator,
    pub(crate) ledger: Ledger,
    pub(crate) listeners: ListenerRegistry,
    pub(crate) watches: WatchRegistry,
    pub(crate) locked: AtomicBool,
    /// Namespace to storage key, for namespaces created with `persist`.
    pub(crate) persistent: Mutex<IndexMap<String, String>>,
}

impl StoreInner {
    /// Deep clone of the whole tree as one object keyed by namespace.
    pub(crate) fn snapshot_value(&self) -> Value {
        let state = self.state.lock();
        Value::Object(
            state
                .iter()
                .map(|(namespace, value)| (namespace.clone(), value.clone()))
                .collect(),
        )
    }

    /// Re-persist every persistent namespace.
    pub(crate) fn persist_all(&self) {
        let Some(storage) = &self.options.storage else {
            return;
        };
        let entries: Vec<(String, String)> = self
            .persistent
            .lock()
            .iter()
            .map(|(namespace, key)| (namespace.clone(), key.clone()))
            .collect();
        if entries.is_empty() {
            return;
        }
        let state = self.state.lock();
        for (namespace, key) in entries {
            if let Some(value) = state.get(&namespace) {
                persist::persist(storage.as_ref(), &key, value);
            }
        }
    }

}

/// Route a write notification: queue each-mutation and settled watchers,
/// fire value-write watchers immediately.
pub(crate) fn notify_write(inner: &Arc<StoreInner>, key: &str) {
    let affected = inner.graph.affected_by(key);
    for id in affected {
        let Some((has_value, has_each, has_settled)) = inner.watches.classes(id) else {
            continue;
        };
        if has_each || has_settled {
            let mut st = inner.coord.state.lock();
            if has_each {
                st.pending_each.insert(id);
            }
            if has_settled {
                st.pending_settled.insert(id);
            }
        }
        if has_value {
            watch::run_watch(inner, id, FireCause::ValueWrite);
        }
    }
}

/// Install a rewritten state tree (undo/redo). Triggers are held back until
/// the whole tree is in place, so the replacement is atomic to observers.
pub(crate) fn install_tree(inner: &Arc<StoreInner>, tree: Value) {
    let Value::Object(tree) = tree else {
        tracing::error!("refusing to install a non-object state tree");
        return;
    };
    let incoming: IndexMap<String, Value> = tree.into_iter().collect();
    let changed: Vec<String> = {
        let mut state = inner.state.lock();
        let mut changed: Vec<String> = incoming
            .iter()
            .filter(|(namespace, value)| state.get(*namespace) != Some(*value))
            .map(|(namespace, _)| namespace.clone())
            .collect();
        changed.extend(
            state
                .keys()
                .filter(|namespace| !incoming.contains_key(*namespace))
                .cloned(),
        );
        *state = incoming;
        changed
    };
    cov_mark::hit!(replacement_notifies_after_install);
    for namespace in changed {
        notify_write(inner, &namespace);
    }
}

fn append_system_record(inner: &Arc<StoreInner>, reason: String, before: Option<Value>) {
    let Some(before) = before else {
        return;
    };
    let record = DiffRecord::system(reason, diff(&before, &inner.snapshot_value()));
    inner.ledger.append_system(inner, record);
}

/// A mutation-tracking state container.
///
/// Application state lives in namespaced JSON values. Every mutation flows
/// through [`mutate`](Store::mutate), which records a causally ordered tree
/// of diff records in the history ledger; watchers subscribe to derived
/// values under three timing contracts; the ledger supports commit, undo and
/// redo.
///
/// # Quick start
///
/// ```ignore
/// use chronik::{Store, StoreOptions, WatchOptions};
/// use serde_json::json;
///
/// let store = Store::new(StoreOptions::default());
/// let counter = store.create_state("counter", json!({"count": 0}), Default::default())?;
///
/// // Direct writes are rejected; this returns UnauthorizedMutation:
/// assert!(counter.set("count", json!(1)).is_err());
///
/// let view = counter.clone();
/// store.mutate("increment", move || {
///     view.set("count", json!(1)).unwrap();
/// })?;
///
/// store.undo(1)?;                        // count back to 0
/// store.redo(1)?;                        // count forward to 1
/// ```
///
/// One outer mutation call chain at a time: the nesting bookkeeping that
/// reconstructs the call tree is shared per store, so two genuinely
/// concurrent outer calls would interleave their children into one tree.
///
/// `Store` is a cheap handle; clone it freely into watcher callbacks and
/// completion hooks.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Build a store.
    pub fn new(options: StoreOptions) -> Self {
        let diagnostics = options.diagnostics.clone();
        let inner = Arc::new(StoreInner {
            options,
            state: Mutex::new(IndexMap::new()),
            graph: ReactiveGraph::new(),
            coord: Coordinator::new(),
            ledger: Ledger::new(),
            listeners: ListenerRegistry::new(),
            watches: WatchRegistry::new(),
            locked: AtomicBool::new(false),
            persistent: Mutex::new(IndexMap::new()),
        });
        if let Some(port) = diagnostics {
            port.attach(Diagnostics::new(Arc::downgrade(&inner)));
        }
        Store { inner }
    }

    /// Install a namespace and return a live view of it.
    ///
    /// Namespaces are unique; re-declaration fails unless the store runs in
    /// devtools mode, where it warns and replaces. With `persist` set and a
    /// storage backend configured, previously stored state hydrates the
    /// initial value (limited to properties the initial shape already has).
    pub fn create_state(
        &self,
        namespace: impl Into<String>,
        initial: Value,
        options: NamespaceOptions,
    ) -> Result<StateView> {
        let namespace = namespace.into();
        if self.inner.state.lock().contains_key(&namespace) {
            if self.inner.options.devtools {
                tracing::warn!(%namespace, "replacing an existing namespace (devtools mode)");
            } else {
                return Err(StoreError::DuplicateNamespace(namespace));
            }
        }

        let mut value = initial;
        let mut persist_key = None;
        if options.persist {
            match &self.inner.options.storage {
                Some(storage) => {
                    let key = options
                        .persist_key
                        .clone()
                        .unwrap_or_else(|| persist::storage_key(&namespace));
                    persist::hydrate(storage.as_ref(), &key, &mut value);
                    persist_key = Some(key);
                }
                None => {
                    tracing::warn!(%namespace, "persistence requested without a storage backend");
                }
            }
        }

        let before = self
            .inner
            .options
            .diffing
            .then(|| self.inner.snapshot_value());
        self.inner.state.lock().insert(namespace.clone(), value);
        append_system_record(&self.inner, format!("init {namespace}"), before);

        if let Some(key) = persist_key {
            self.inner
                .persistent
                .lock()
                .insert(namespace.clone(), key);
            self.inner.persist_all();
        }

        notify_write(&self.inner, &namespace);
        Ok(StateView::root(Arc::clone(&self.inner), namespace))
    }

    /// Remove a namespace and append a terminal "destroyed" record.
    pub fn destroy_state(&self, namespace: &str) -> Result<()> {
        let before = {
            let mut state = self.inner.state.lock();
            if !state.contains_key(namespace) {
                return Err(StoreError::UnknownNamespace(namespace.to_owned()));
            }
            let before = self
                .inner
                .options
                .diffing
                .then(|| Value::Object(state.iter().map(|(k, v)| (k.clone(), v.clone())).collect()));
            state.shift_remove(namespace);
            before
        };
        append_system_record(&self.inner, format!("destroy {namespace}"), before);

        if let Some(key) = self.inner.persistent.lock().shift_remove(namespace)
            && let Some(storage) = &self.inner.options.storage
        {
            storage.remove_item(&key);
        }
        notify_write(&self.inner, namespace);
        Ok(())
    }

    /// Run a synchronous mutation.
    ///
    /// The `reason` lands on the history record; the mutator performs its
    /// writes through [`StateView`] handles it captured. Nested calls from
    /// inside the mutator (or from watcher callbacks it triggers) become
    /// child records of this one.
    pub fn mutate(&self, reason: impl Into<String>, mutator: impl FnOnce()) -> Result<MutationHandle> {
        coordinator::mutate_full_inner(
            &self.inner,
            reason.into(),
            || {
                mutator();
                Outcome::Sync
            },
            None,
            None,
            None,
        )
    }

    /// Run a mutation that may return a pending continuation.
    pub fn mutate_async(
        &self,
        reason: impl Into<String>,
        mutator: impl FnOnce() -> Outcome,
    ) -> Result<MutationHandle> {
        coordinator::mutate_full_inner(&self.inner, reason.into(), mutator, None, None, None)
    }

    /// Full mutation entry point with completion and error hooks.
    ///
    /// `on_done` runs when the mutation and its entire continuation chain
    /// settle. `on_error` runs (as a mutator) when a continuation rejects;
    /// without it, rejections are logged and isolated.
    pub fn mutate_with(
        &self,
        reason: impl Into<String>,
        mutator: impl FnOnce() -> Outcome,
        on_done: Option<Box<dyn FnOnce() + Send>>,
        on_error: Option<OnError>,
    ) -> Result<MutationHandle> {
        let handle =
            coordinator::mutate_full_inner(&self.inner, reason.into(), mutator, on_error, None, None)?;
        if let Some(on_done) = on_done {
            handle.on_done(on_done);
        }
        Ok(handle)
    }

    /// Subscribe to a derived value.
    ///
    /// The getter runs under dependency tracking; it re-evaluates whenever a
    /// property it read changes. Keep the returned handle alive for as long
    /// as the subscription should run; dropping it unsubscribes.
    pub fn watch(
        &self,
        getter: impl FnMut() -> Value + Send + 'static,
        options: WatchOptions,
    ) -> WatchHandle {
        let id = watch::register(&self.inner, getter, options);
        WatchHandle::new(id, Arc::downgrade(&self.inner))
    }

    /// Subscribe to finished ledger records. Unless `lazy`, the existing
    /// ledger replays to the callback first.
    pub fn subscribe_diffs(
        &self,
        callback: impl FnMut(&DiffRecord, DiffNotification) + Send + 'static,
        lazy: bool,
    ) -> ListenerId {
        let existing = self.inner.ledger.records();
        self.inner
            .listeners
            .subscribe(Box::new(callback), lazy, &existing)
    }

    /// Remove a diff listener.
    pub fn unsubscribe_diffs(&self, id: ListenerId) -> bool {
        self.inner.listeners.unsubscribe(id)
    }

    /// Collapse the first `count` ledger records (default: all) into one
    /// synthesized record. Replaying the resulting ledger reconstructs the
    /// same states as before.
    pub fn commit(&self, count: Option<usize>) -> Result<()> {
        ledger::commit(&self.inner, count)
    }

    /// Revert the last `steps` eligible user mutations.
    pub fn undo(&self, steps: usize) -> Result<()> {
        ledger::undo(&self.inner, steps)
    }

    /// Re-apply up to `steps` undone mutations. A no-op unless an undo
    /// happened and no user mutation has intervened since.
    pub fn redo(&self, steps: usize) -> Result<()> {
        ledger::redo(&self.inner, steps)
    }

    /// Deep clone of the full state tree, keyed by namespace.
    pub fn snapshot(&self) -> Value {
        self.inner.snapshot_value()
    }

    /// Clone of the current history ledger.
    pub fn ledger(&self) -> Vec<DiffRecord> {
        self.inner.ledger.records()
    }

    /// Reconstructed full state as of ledger index `index`.
    pub fn state_at(&self, index: usize) -> Option<Value> {
        ledger::state_at(&self.inner, index)
    }

    /// Engage the administrative modification lock. Mutations attempted while
    /// locked are logged and skipped, not failed.
    pub fn lock(&self) {
        self.inner.locked.store(true, Ordering::Release);
    }

    /// Release the administrative modification lock.
    pub fn unlock(&self) {
        self.inner.locked.store(false, Ordering::Release);
    }

    /// True while the administrative modification lock is engaged.
    pub fn is_locked(&self) -> bool {
        self.inner.locked.load(Ordering::Acquire)
    }
}
