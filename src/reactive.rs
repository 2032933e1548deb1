//! Dependency tracking between state properties and watchers.
//!
//! Every property in the tree is addressed by a namespace-qualified key. When
//! a watcher getter runs, a thread-local tracking scope captures the keys it
//! reads; the graph then maps each key to the watchers subscribed to it.
//! Writes look up the affected watchers by key.
//!
//! A write notifies three groups of subscribers:
//! - the written key itself,
//! - ancestors of the key (a container's derived value changes when anything
//!   inside it changes),
//! - subscribed descendants (replacing a subtree wholesale must reach
//!   watchers of its inner properties).

use std::cell::RefCell;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;

use crate::watch::WatchId;

/// Separator between path segments inside a property key.
///
/// NUL cannot round-trip through JSON text, which keeps user object keys from
/// aliasing a nested path.
pub(crate) const KEY_SEP: char = '\u{0}';

thread_local! {
    /// Stack of active tracking scopes. Only the innermost scope records
    /// reads; watcher getters never need to leak reads into an outer scope.
    static TRACK_SCOPES: RefCell<Vec<IndexSet<String>>> = const { RefCell::new(Vec::new()) };
}

/// True while at least one tracking scope is active.
///
/// Lets read paths skip key construction entirely when nobody is tracking.
pub(crate) fn scope_active() -> bool {
    TRACK_SCOPES.with(|scopes| !scopes.borrow().is_empty())
}

/// Record a property read into the innermost tracking scope, if any.
pub(crate) fn record_read(key: &str) {
    TRACK_SCOPES.with(|scopes| {
        if let Some(top) = scopes.borrow_mut().last_mut() {
            top.insert(key.to_owned());
        }
    });
}

/// Run `f` under a fresh tracking scope and return the keys it read.
///
/// Scopes nest: reads inside an inner scope are invisible to the outer one.
/// The scope is popped even when `f` panics so a poisoned watcher cannot
/// corrupt tracking for the rest of the process.
pub(crate) fn run_tracked<R>(f: impl FnOnce() -> R) -> (R, IndexSet<String>) {
    struct ScopeGuard;
    impl Drop for ScopeGuard {
        fn drop(&mut self) {
            TRACK_SCOPES.with(|scopes| {
                scopes.borrow_mut().pop();
            });
        }
    }

    TRACK_SCOPES.with(|scopes| scopes.borrow_mut().push(IndexSet::new()));
    let guard = ScopeGuard;
    let result = f();
    let keys = TRACK_SCOPES.with(|scopes| {
        scopes
            .borrow_mut()
            .last_mut()
            .map(std::mem::take)
            .unwrap_or_default()
    });
    drop(guard);
    (result, keys)
}

/// Per-store subscription graph: property key to ordered watcher set.
#[derive(Default)]
pub(crate) struct ReactiveGraph {
    subs: Mutex<IndexMap<String, IndexSet<WatchId>>>,
}

impl ReactiveGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Subscribe a watcher to every key it read during evaluation.
    pub(crate) fn subscribe(&self, watch: WatchId, keys: &IndexSet<String>) {
        let mut subs = self.subs.lock();
        for key in keys {
            subs.entry(key.clone()).or_default().insert(watch);
        }
    }

    /// Drop all subscriptions of a watcher, before re-evaluation or removal.
    pub(crate) fn clear(&self, watch: WatchId) {
        let mut subs = self.subs.lock();
        subs.retain(|_, watchers| {
            watchers.shift_remove(&watch);
            !watchers.is_empty()
        });
    }

    /// Watchers affected by a write to `key`, in subscription order.
    pub(crate) fn affected_by(&self, key: &str) -> Vec<WatchId> {
        let subs = self.subs.lock();
        let mut affected: IndexSet<WatchId> = IndexSet::new();
        let mut descendant_prefix = String::with_capacity(key.len() + 1);
        descendant_prefix.push_str(key);
        descendant_prefix.push(KEY_SEP);

        for (subscribed, watchers) in subs.iter() {
            let hit = subscribed == key
                || subscribed.starts_with(&descendant_prefix)
                || is_ancestor(subscribed, key);
            if hit {
                affected.extend(watchers.iter().copied());
            }
        }
        affected.into_iter().collect()
    }
}

fn is_ancestor(candidate: &str, key: &str) -> bool {
    key.len() > candidate.len()
        && key.starts_with(candidate)
        && key[candidate.len()..].starts_with(KEY_SEP)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(parts: &[&str]) -> String {
        parts.join("\u{0}")
    }

    #[test]
    fn scope_captures_reads() {
        let ((), keys) = run_tracked(|| {
            record_read("a");
            record_read("b");
            record_read("a");
        });
        assert_eq!(keys.len(), 2);
        assert!(keys.contains("a") && keys.contains("b"));
    }

    #[test]
    fn nested_scopes_do_not_leak() {
        let ((), outer) = run_tracked(|| {
            record_read("outer");
            let ((), inner) = run_tracked(|| record_read("inner"));
            assert!(inner.contains("inner"));
        });
        assert_eq!(outer.len(), 1);
        assert!(outer.contains("outer"));
    }

    #[test]
    fn reads_outside_any_scope_are_ignored() {
        record_read("nobody-listens");
        let ((), keys) = run_tracked(|| {});
        assert!(keys.is_empty());
    }

    #[test]
    fn write_reaches_exact_ancestor_and_descendant_subscribers() {
        let graph = ReactiveGraph::new();
        let exact = WatchId::new(0);
        let ancestor = WatchId::new(1);
        let descendant = WatchId::new(2);
        let unrelated = WatchId::new(3);

        let mut keys = IndexSet::new();
        keys.insert(key(&["ns", "a", "b"]));
        graph.subscribe(exact, &keys);

        let mut keys = IndexSet::new();
        keys.insert(key(&["ns", "a"]));
        graph.subscribe(ancestor, &keys);

        let mut keys = IndexSet::new();
        keys.insert(key(&["ns", "a", "b", "c"]));
        graph.subscribe(descendant, &keys);

        let mut keys = IndexSet::new();
        keys.insert(key(&["ns", "z"]));
        graph.subscribe(unrelated, &keys);

        let affected = graph.affected_by(&key(&["ns", "a", "b"]));
        assert!(affected.contains(&exact));
        assert!(affected.contains(&ancestor));
        assert!(affected.contains(&descendant));
        assert!(!affected.contains(&unrelated));
    }

    #[test]
    fn clear_removes_every_subscription() {
        let graph = ReactiveGraph::new();
        let watch = WatchId::new(7);
        let mut keys = IndexSet::new();
        keys.insert("x".to_owned());
        keys.insert("y".to_owned());
        graph.subscribe(watch, &keys);

        graph.clear(watch);
        assert!(graph.affected_by("x").is_empty());
        assert!(graph.affected_by("y").is_empty());
    }
}
