#![deny(missing_docs)]

//! Mutation-tracking state container with a causal diff ledger.
//!
//! Application state lives in namespaced JSON values. Every mutation must
//! flow through a single entry point that records a causally ordered,
//! hierarchical log of diffs; watchers subscribe to fine- or coarse-grained
//! views of that log, and the ledger supports commit, undo and redo. Direct
//! writes outside the sanctioned entry point are impossible: they fail with
//! [`StoreError::UnauthorizedMutation`].
//!
//! # Quick Start
//!
//! ```ignore
//! use chronik::{Store, StoreOptions, WatchOptions};
//! use serde_json::json;
//!
//! let store = Store::new(StoreOptions::default());
//! let todos = store.create_state("todos", json!({"items": []}), Default::default())?;
//!
//! // Watch a derived value; fires after every completed mutation call.
//! let list = todos.clone();
//! let _watch = store.watch(
//!     move || list.get("items").value(),
//!     WatchOptions::new().on_each_mutation(|new, _old| {
//!         println!("items changed: {new}");
//!     }),
//! );
//!
//! let view = todos.clone();
//! store.mutate("add first todo", move || {
//!     view.get("items").push(json!({"title": "write docs"})).unwrap();
//! })?;
//!
//! store.undo(1)?;   // items back to []
//! store.redo(1)?;   // and forward again
//! ```
//!
//! # Core Types
//!
//! - [`Store`] - owns the namespace map, the mutation coordinator and the
//!   history ledger.
//! - [`StateView`] - observable handle scoping a path into one namespace;
//!   nested access returns freshly scoped views, writes are authorized
//!   against the mutation-in-progress flag.
//! - [`DiffRecord`] - one node of the history tree: a reversible [`Delta`]
//!   plus the nested mutations it caused.
//! - [`WatchOptions`] - derived-value subscriptions with three timing
//!   contracts (per write, per mutation call, per outer settle).
//! - [`Outcome`] / [`Continuation`] - asynchronous mutators return a pending
//!   continuation whose settlement records a linked follow-up record.
//!
//! # History
//!
//! Nested mutation calls become child records: a watcher callback that
//! mutates in response to a record's completion produces a child tagged with
//! `triggered_by`, so cascades read as a causal tree rather than a flat
//! list. Replaying the ledger forward from the empty tree always
//! reconstructs the live state; undo and redo append compensating records
//! instead of deleting history.

mod continuation;
mod coordinator;
mod delta;
mod diagnostics;
mod error;
mod ledger;
mod listener;
mod persist;
mod reactive;
mod record;
mod store;
mod view;
mod watch;

pub use continuation::{Continuation, OnError, Resolver};
pub use coordinator::{MutationHandle, Outcome};
pub use delta::{Delta, diff, patch, unpatch};
pub use diagnostics::{Diagnostics, DiagnosticsPort};
pub use error::{Result, StoreError};
pub use listener::{DiffNotification, ListenerId};
pub use persist::{MemoryStorage, StorageBackend};
pub use record::{DiffId, DiffRecord};
pub use store::{NamespaceOptions, Store, StoreOptions};
pub use view::StateView;
pub use watch::{Comparator, WatchCallback, WatchHandle, WatchId, WatchOptions};
