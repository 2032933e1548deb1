//! Injectable diagnostics port for out-of-process inspection.
//!
//! Instead of installing the store's surface on a process-wide global, a host
//! (say, a devtools bridge) registers a [`DiagnosticsPort`] via
//! [`StoreOptions`](crate::StoreOptions); the store hands it a [`Diagnostics`]
//! handle at construction. The handle holds a weak reference, so an attached
//! bridge never keeps a dead store alive.

use std::sync::Weak;

use serde_json::Value;

use crate::listener::{DiffNotification, ListenerId};
use crate::record::DiffRecord;
use crate::store::StoreInner;

/// Host-side receiver for a store's diagnostics handle.
pub trait DiagnosticsPort: Send + Sync {
    /// Called once when the store is constructed.
    fn attach(&self, diagnostics: Diagnostics);
}

/// Inspection surface handed to a [`DiagnosticsPort`].
#[derive(Clone)]
pub struct Diagnostics {
    store: Weak<StoreInner>,
}

impl Diagnostics {
    pub(crate) fn new(store: Weak<StoreInner>) -> Self {
        Self { store }
    }

    /// Deep clone of the full state tree; `None` once the store is gone.
    pub fn snapshot(&self) -> Option<Value> {
        Some(self.store.upgrade()?.snapshot_value())
    }

    /// Clone of the current ledger; `None` once the store is gone.
    pub fn ledger(&self) -> Option<Vec<DiffRecord>> {
        Some(self.store.upgrade()?.ledger.records())
    }

    /// Subscribe to ledger notifications, like
    /// [`Store::subscribe_diffs`](crate::Store::subscribe_diffs).
    pub fn subscribe(
        &self,
        callback: impl FnMut(&DiffRecord, DiffNotification) + Send + 'static,
        lazy: bool,
    ) -> Option<ListenerId> {
        let inner = self.store.upgrade()?;
        let existing = inner.ledger.records();
        Some(inner
            .listeners
            .subscribe(Box::new(callback), lazy, &existing))
    }
}
