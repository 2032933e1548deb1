//! History records: one node in the causal diff tree.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::delta::Delta;

/// Unique identifier of a [`DiffRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiffId(Uuid);

impl DiffId {
    /// Generate a fresh identifier.
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for DiffId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One recorded mutation: a scoped delta plus the nested mutations it caused.
///
/// Records are created when a mutation call begins, finalized when the
/// outermost call of their chain completes, and immutable once they reach the
/// ledger. The `sub_entries` tree mirrors the runtime nesting of mutation
/// calls, including calls re-entered from watcher callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffRecord {
    /// Unique id, generated at creation.
    pub id: DiffId,
    /// Creation time, milliseconds since the unix epoch.
    pub timestamp: u64,
    /// Caller-supplied description of why the mutation happened.
    pub reason: String,
    /// Structural delta between the snapshots around this call.
    ///
    /// `None` when the call changed nothing. A record's delta spans its own
    /// before/after pair, so a parent's delta covers the net effect of its
    /// children as well.
    pub delta: Option<Delta>,
    /// Records produced by mutation calls nested inside this one, in call
    /// order.
    pub sub_entries: Vec<DiffRecord>,
    /// True when the mutator returned a pending continuation.
    pub is_async: bool,
    /// Id of the record whose continuation produced this record.
    pub async_origin: Option<DiffId>,
    /// Id of the record whose completion fired the watcher callback that
    /// started this mutation. Absent for mutations initiated directly.
    pub triggered_by: Option<DiffId>,
    /// True for init/destroy/commit/undo/redo records. System records are
    /// never eligible for undo.
    pub is_system: bool,
    /// Captured call-site backtrace; only populated when stack capture is
    /// enabled on the store.
    pub stack_trace: Option<String>,
}

impl DiffRecord {
    pub(crate) fn new(reason: String, triggered_by: Option<DiffId>, stack_trace: Option<String>) -> Self {
        Self {
            id: DiffId::new(),
            timestamp: now_millis(),
            reason,
            delta: None,
            sub_entries: Vec::new(),
            is_async: false,
            async_origin: None,
            triggered_by,
            is_system: false,
            stack_trace,
        }
    }

    /// A store-generated record (init/destroy/commit/undo/redo).
    pub(crate) fn system(reason: String, delta: Option<Delta>) -> Self {
        Self {
            id: DiffId::new(),
            timestamp: now_millis(),
            reason,
            delta,
            sub_entries: Vec::new(),
            is_async: false,
            async_origin: None,
            triggered_by: None,
            is_system: true,
            stack_trace: None,
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
