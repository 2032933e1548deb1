//! The history ledger: the ordered sequence of top-level diff records.
//!
//! The ledger upholds one invariant above all: replaying every record's delta
//! forward from the empty tree reconstructs the live state exactly, and
//! replaying backward from the live state reconstructs any prior state. Undo
//! and redo never delete records; they mark ids undone and append
//! system-generated compensation records, so the invariant survives arbitrary
//! history rewinding.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::coordinator;
use crate::delta::{diff, patch, unpatch};
use crate::error::{Result, StoreError};
use crate::record::{DiffId, DiffRecord};
use crate::store::StoreInner;

pub(crate) struct Ledger {
    state: Mutex<LedgerState>,
}

struct LedgerState {
    records: Vec<DiffRecord>,
    /// Ids of undone records, in the order they were undone. The tail is the
    /// most recently undone record and the first redo candidate.
    undone: Vec<DiffId>,
    /// Cleared by any new user mutation: redoing past a fresh edit would
    /// silently disagree with the user's latest intent.
    redo_enabled: bool,
}

impl Ledger {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                records: Vec::new(),
                undone: Vec::new(),
                redo_enabled: false,
            }),
        }
    }

    pub(crate) fn records(&self) -> Vec<DiffRecord> {
        self.state.lock().records.clone()
    }

    /// Append finished user records from an outermost mutate call, in order.
    pub(crate) fn push_user_records(&self, inner: &Arc<StoreInner>, records: Vec<DiffRecord>) {
        let appended = {
            let mut st = self.state.lock();
            st.redo_enabled = false;
            st.records.extend(records.iter().cloned());
            records
        };
        for record in &appended {
            inner.listeners.notify_append(record);
        }
    }

    /// Append one system-generated record (init/destroy/undo/redo).
    pub(crate) fn append_system(&self, inner: &Arc<StoreInner>, record: DiffRecord) {
        self.state.lock().records.push(record.clone());
        inner.listeners.notify_append(&record);
    }
}

/// Reconstruct the full state as of `records[index]`.
///
/// Replays forward from the empty tree when the index sits in the first half
/// of the ledger and backward from the live tree otherwise, bounding the work
/// to half the ledger length. Ties go to forward replay.
fn state_at_index(records: &[DiffRecord], index: usize, live: &Value) -> Value {
    let forward_cost = index + 1;
    let backward_cost = records.len() - 1 - index;
    if forward_cost <= backward_cost {
        let mut value = empty_tree();
        for record in &records[..=index] {
            if let Some(delta) = &record.delta {
                patch(&mut value, delta);
            }
        }
        value
    } else {
        let mut value = live.clone();
        for record in records[index + 1..].iter().rev() {
            if let Some(delta) = &record.delta {
                unpatch(&mut value, delta);
            }
        }
        value
    }
}

pub(crate) fn empty_tree() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Public `state_at`: `None` past the end of the ledger.
pub(crate) fn state_at(inner: &Arc<StoreInner>, index: usize) -> Option<Value> {
    let st = inner.ledger.state.lock();
    if index >= st.records.len() {
        return None;
    }
    Some(state_at_index(&st.records, index, &inner.snapshot_value()))
}

/// Collapse the first `count` records (default: all) into one synthesized
/// system record whose delta spans from the empty tree to the combined state.
pub(crate) fn commit(inner: &Arc<StoreInner>, count: Option<usize>) -> Result<()> {
    if inner.coord.in_flight() {
        return Err(StoreError::MutationInFlight);
    }
    let resulting = {
        let mut st = inner.ledger.state.lock();
        let len = st.records.len();
        let count = count.unwrap_or(len).min(len);
        if count == 0 {
            return Ok(());
        }
        let combined = state_at_index(&st.records, count - 1, &inner.snapshot_value());
        let synthesized = DiffRecord::system(
            format!("commit {count} diffs"),
            diff(&empty_tree(), &combined),
        );
        st.records.splice(..count, std::iter::once(synthesized));
        st.records.clone()
    };
    inner.listeners.notify_commit(&resulting);
    Ok(())
}

/// Revert the last `steps` eligible (non-system, not already undone) records.
pub(crate) fn undo(inner: &Arc<StoreInner>, steps: usize) -> Result<()> {
    if inner.coord.in_flight() {
        return Err(StoreError::MutationInFlight);
    }
    if steps == 0 {
        return Ok(());
    }
    let (working, record) = {
        let mut st = inner.ledger.state.lock();
        let eligible: Vec<(DiffId, Option<crate::delta::Delta>)> = st
            .records
            .iter()
            .filter(|r| !r.is_system && !st.undone.contains(&r.id))
            .map(|r| (r.id, r.delta.clone()))
            .collect();
        let count = steps.min(eligible.len());
        if count == 0 {
            tracing::info!("nothing to undo");
            return Ok(());
        }
        let before = inner.snapshot_value();
        let mut working = before.clone();
        // Reverse chronological order: newest first.
        for (id, delta) in eligible[eligible.len() - count..].iter().rev() {
            if let Some(delta) = delta {
                unpatch(&mut working, delta);
            }
            st.undone.push(*id);
        }
        st.redo_enabled = true;
        let record = DiffRecord::system(format!("undo {count} diffs"), diff(&before, &working));
        (working, record)
    };
    finish_history_rewrite(inner, working, record);
    Ok(())
}

/// Re-apply up to `steps` previously undone records, most recently undone
/// first. A no-op unless an undo happened and no user mutation intervened.
pub(crate) fn redo(inner: &Arc<StoreInner>, steps: usize) -> Result<()> {
    if inner.coord.in_flight() {
        return Err(StoreError::MutationInFlight);
    }
    if steps == 0 {
        return Ok(());
    }
    let (working, record) = {
        let mut st = inner.ledger.state.lock();
        if !st.redo_enabled || st.undone.is_empty() {
            tracing::info!("nothing to redo");
            return Ok(());
        }
        let count = steps.min(st.undone.len());
        let before = inner.snapshot_value();
        let mut working = before.clone();
        for _ in 0..count {
            let id = st.undone.pop().expect("count is bounded by undone.len()");
            match st.records.iter().find(|r| r.id == id) {
                Some(found) => {
                    if let Some(delta) = &found.delta {
                        patch(&mut working, delta);
                    }
                }
                // A commit may have collapsed the record away; its effect is
                // already part of the synthesized delta.
                None => tracing::warn!(%id, "undone record no longer in the ledger; skipped"),
            }
        }
        let record = DiffRecord::system(format!("redo {count} diffs"), diff(&before, &working));
        (working, record)
    };
    finish_history_rewrite(inner, working, record);
    Ok(())
}

/// Install the rewritten state, append the compensation record and re-run
/// both watcher queues so downstream effects propagate exactly as a normal
/// mutation would.
fn finish_history_rewrite(inner: &Arc<StoreInner>, working: Value, record: DiffRecord) {
    let trigger = record.id;
    crate::store::install_tree(inner, working);
    inner.ledger.append_system(inner, record);
    inner.coord.note_flushed_root(trigger);
    coordinator::drain_each_queue(inner, trigger);
    coordinator::maybe_drain_settled(inner);
    inner.persist_all();
}
