//! Watchers: derived-value subscriptions with three timing contracts.
//!
//! A watcher runs a getter under dependency tracking and re-evaluates when
//! any property it read changes. One watch may subscribe to any combination
//! of the three timing classes:
//!
//! - `on_value_write` fires on every structural write observed, even
//!   mid-mutator,
//! - `on_each_mutation` fires once after each mutate call (nested calls
//!   included) completes,
//! - `on_settled` fires once after the outermost call, its watcher-triggered
//!   cascades and any asynchronous continuations have fully settled.
//!
//! Change detection defaults to structural inequality of the produced values.
//! A caller-supplied comparator can override it; an "unchanged" verdict still
//! advances the stored baseline so later diffs are not computed against a
//! stale value.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use slab::Slab;

use crate::reactive::run_tracked;
use crate::store::StoreInner;

/// Callback invoked with `(new, old)` when a watched value changes.
pub type WatchCallback = Box<dyn FnMut(&Value, &Value) + Send>;

/// Comparator invoked with `(new, old)`; returns true when the values should
/// be treated as changed.
pub type Comparator = Box<dyn Fn(&Value, &Value) -> bool + Send>;

/// Identifier of a registered watcher.
///
/// Carries a generation so a stale handle can never tear down a watcher that
/// happens to reuse the same slab slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId {
    index: u32,
    generation: u32,
}

impl WatchId {
    #[cfg(test)]
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            generation: 0,
        }
    }
}

/// Which timing contract is firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FireCause {
    ValueWrite,
    EachMutation,
    Settled,
}

/// Options for [`Store::watch`](crate::Store::watch).
///
/// Build with the fluent setters; a default options value registers a watch
/// that tracks dependencies but never fires, which is rarely what you want.
#[derive(Default)]
pub struct WatchOptions {
    pub(crate) on_value_write: Option<WatchCallback>,
    pub(crate) on_each_mutation: Option<WatchCallback>,
    pub(crate) on_settled: Option<WatchCallback>,
    pub(crate) changed: Option<Comparator>,
    pub(crate) once: bool,
    pub(crate) emit_initial: bool,
}

impl WatchOptions {
    /// Empty options; attach at least one callback.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire on every structural write, even in the middle of a mutator.
    pub fn on_value_write(mut self, f: impl FnMut(&Value, &Value) + Send + 'static) -> Self {
        self.on_value_write = Some(Box::new(f));
        self
    }

    /// Fire once after each mutate call completes, nested calls included.
    pub fn on_each_mutation(mut self, f: impl FnMut(&Value, &Value) + Send + 'static) -> Self {
        self.on_each_mutation = Some(Box::new(f));
        self
    }

    /// Fire once after the outermost mutate call and its continuations settle.
    pub fn on_settled(mut self, f: impl FnMut(&Value, &Value) + Send + 'static) -> Self {
        self.on_settled = Some(Box::new(f));
        self
    }

    /// Override structural change detection. The comparator receives
    /// `(new, old)` and returns true when the change should fire callbacks.
    pub fn changed_when(mut self, f: impl Fn(&Value, &Value) -> bool + Send + 'static) -> Self {
        self.changed = Some(Box::new(f));
        self
    }

    /// Unsubscribe automatically after the first callback fire.
    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    /// Fire immediately with the current value, before any mutation occurs.
    pub fn emit_initial(mut self) -> Self {
        self.emit_initial = true;
        self
    }
}

pub(crate) struct WatchEntry {
    getter: Box<dyn FnMut() -> Value + Send>,
    on_value_write: Option<WatchCallback>,
    on_each_mutation: Option<WatchCallback>,
    on_settled: Option<WatchCallback>,
    changed: Option<Comparator>,
    once: bool,
    baseline: Value,
    alive: bool,
}

struct WatchSlot {
    generation: u32,
    has_value: bool,
    has_each: bool,
    has_settled: bool,
    entry: Arc<Mutex<WatchEntry>>,
}

#[derive(Default)]
pub(crate) struct WatchRegistry {
    slab: Mutex<Slab<WatchSlot>>,
    generations: AtomicU32,
}

impl WatchRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn insert(&self, entry: WatchEntry) -> WatchId {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let slot = WatchSlot {
            generation,
            has_value: entry.on_value_write.is_some(),
            has_each: entry.on_each_mutation.is_some(),
            has_settled: entry.on_settled.is_some(),
            entry: Arc::new(Mutex::new(entry)),
        };
        let index = self.slab.lock().insert(slot) as u32;
        WatchId { index, generation }
    }

    fn get(&self, id: WatchId) -> Option<Arc<Mutex<WatchEntry>>> {
        let slab = self.slab.lock();
        let slot = slab.get(id.index as usize)?;
        (slot.generation == id.generation).then(|| Arc::clone(&slot.entry))
    }

    /// Timing classes of a watcher as `(value, each, settled)`.
    pub(crate) fn classes(&self, id: WatchId) -> Option<(bool, bool, bool)> {
        let slab = self.slab.lock();
        let slot = slab.get(id.index as usize)?;
        (slot.generation == id.generation)
            .then_some((slot.has_value, slot.has_each, slot.has_settled))
    }

    fn remove(&self, id: WatchId) -> bool {
        let mut slab = self.slab.lock();
        match slab.get(id.index as usize) {
            Some(slot) if slot.generation == id.generation => {
                slab.remove(id.index as usize);
                true
            }
            _ => false,
        }
    }
}

/// Register a watcher: evaluate once to establish dependencies and the
/// baseline, then optionally emit the initial value.
pub(crate) fn register(
    inner: &Arc<StoreInner>,
    getter: impl FnMut() -> Value + Send + 'static,
    options: WatchOptions,
) -> WatchId {
    let entry = WatchEntry {
        getter: Box::new(getter),
        on_value_write: options.on_value_write,
        on_each_mutation: options.on_each_mutation,
        on_settled: options.on_settled,
        changed: options.changed,
        once: options.once,
        baseline: Value::Null,
        alive: true,
    };
    let id = inner.watches.insert(entry);

    let entry_arc = inner.watches.get(id).expect("freshly inserted watcher");
    let mut guard = entry_arc.lock();
    guard.baseline = evaluate(inner, id, &mut guard.getter);

    if options.emit_initial {
        let entry = &mut *guard;
        let current = entry.baseline.clone();
        let mut fired = false;
        for callback in [
            entry.on_value_write.as_mut(),
            entry.on_each_mutation.as_mut(),
            entry.on_settled.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            callback(&current, &Value::Null);
            fired = true;
        }
        if fired && entry.once {
            entry.alive = false;
            drop(guard);
            unsubscribe(inner, id);
        }
    }
    id
}

/// Re-evaluate the getter under a fresh tracking scope, replacing the
/// watcher's subscriptions with the keys actually read this time.
fn evaluate(
    inner: &Arc<StoreInner>,
    id: WatchId,
    getter: &mut Box<dyn FnMut() -> Value + Send>,
) -> Value {
    inner.graph.clear(id);
    let (value, keys) = run_tracked(|| getter());
    inner.graph.subscribe(id, &keys);
    value
}

/// Run one watcher for one timing class: re-evaluate, advance the baseline,
/// fire the matching callback when the value changed.
pub(crate) fn run_watch(inner: &Arc<StoreInner>, id: WatchId, cause: FireCause) {
    let Some(entry) = inner.watches.get(id) else {
        return;
    };
    // A watcher whose callback writes one of its own dependencies would
    // re-enter here mid-run; treat that as a no-op instead of deadlocking.
    let Some(mut entry) = entry.try_lock() else {
        cov_mark::hit!(self_triggering_watch_skipped);
        tracing::warn!(?id, "watcher re-triggered itself while running; skipping");
        return;
    };
    if !entry.alive {
        return;
    }

    let new = evaluate(inner, id, &mut entry.getter);
    let changed = match &entry.changed {
        Some(comparator) => comparator(&new, &entry.baseline),
        None => new != entry.baseline,
    };
    // The baseline always advances, even on an "unchanged" verdict, so the
    // next comparison is never against a stale value.
    let old = std::mem::replace(&mut entry.baseline, new.clone());
    if !changed {
        return;
    }

    let callback = match cause {
        FireCause::ValueWrite => entry.on_value_write.as_mut(),
        FireCause::EachMutation => entry.on_each_mutation.as_mut(),
        FireCause::Settled => entry.on_settled.as_mut(),
    };
    let Some(callback) = callback else {
        return;
    };
    callback(&new, &old);

    if entry.once {
        entry.alive = false;
        drop(entry);
        unsubscribe(inner, id);
    }
}

pub(crate) fn unsubscribe(inner: &Arc<StoreInner>, id: WatchId) {
    if inner.watches.remove(id) {
        inner.graph.clear(id);
        inner.coord.forget_watch(id);
    }
}

/// Live subscription returned by [`Store::watch`](crate::Store::watch).
///
/// Dropping the handle unsubscribes the watcher, so keep it alive for as long
/// as the subscription should run.
pub struct WatchHandle {
    id: WatchId,
    store: Weak<StoreInner>,
}

impl WatchHandle {
    pub(crate) fn new(id: WatchId, store: Weak<StoreInner>) -> Self {
        Self { id, store }
    }

    /// Stop the subscription now.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.store.upgrade() {
            unsubscribe(&inner, self.id);
        }
    }
}
