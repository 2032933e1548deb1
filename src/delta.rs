//! Reversible structural deltas over plain JSON values.
//!
//! [`diff`] computes the difference between two snapshots, [`patch`] applies
//! it forward and [`unpatch`] applies it in reverse. Deltas carry the
//! before-value of every removal and change, which is what makes the history
//! ledger replayable in both directions.
//!
//! Array diffing is deterministic, order-sensitive and index-based: elements
//! are compared pairwise up to the common length, anything past it is a
//! trailing insert or removal. There is no move detection; a shifted element
//! shows up as changed indices.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One node of a structural delta.
///
/// `Object` and `Array` recurse into containers; the leaf variants replace a
/// value wholesale. A delta is always reversible: see [`Delta::inverted`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Delta {
    /// A value that exists only in the after-snapshot.
    Add(Value),
    /// A value that exists only in the before-snapshot (kept for reversal).
    Remove(Value),
    /// A leaf replacement, `(before, after)`.
    Change(Value, Value),
    /// Per-key changes inside an object.
    Object(IndexMap<String, Delta>),
    /// Per-index changes inside an array, applied in order.
    ///
    /// Trailing removals are recorded with descending indices so they can be
    /// applied front-to-back; trailing inserts with ascending indices.
    Array(Vec<(usize, Delta)>),
}

impl Delta {
    /// The exact reverse of this delta.
    ///
    /// Applying the inverse after the original is the identity. Array entries
    /// are reversed so that inverted trailing inserts become valid
    /// back-to-front removals and vice versa.
    pub fn inverted(&self) -> Delta {
        match self {
            Delta::Add(v) => Delta::Remove(v.clone()),
            Delta::Remove(v) => Delta::Add(v.clone()),
            Delta::Change(before, after) => Delta::Change(after.clone(), before.clone()),
            Delta::Object(entries) => Delta::Object(
                entries
                    .iter()
                    .map(|(k, d)| (k.clone(), d.inverted()))
                    .collect(),
            ),
            Delta::Array(entries) => Delta::Array(
                entries
                    .iter()
                    .rev()
                    .map(|(i, d)| (*i, d.inverted()))
                    .collect(),
            ),
        }
    }
}

/// Compute the delta between two snapshots.
///
/// Returns `None` when the snapshots are structurally equal; an absent delta
/// is the canonical "nothing changed" marker on history records.
pub fn diff(before: &Value, after: &Value) -> Option<Delta> {
    if before == after {
        return None;
    }
    match (before, after) {
        (Value::Object(a), Value::Object(b)) => {
            let mut entries = IndexMap::new();
            for (key, old) in a {
                match b.get(key) {
                    Some(new) => {
                        if let Some(d) = diff(old, new) {
                            entries.insert(key.clone(), d);
                        }
                    }
                    None => {
                        entries.insert(key.clone(), Delta::Remove(old.clone()));
                    }
                }
            }
            for (key, new) in b {
                if !a.contains_key(key) {
                    entries.insert(key.clone(), Delta::Add(new.clone()));
                }
            }
            Some(Delta::Object(entries))
        }
        (Value::Array(a), Value::Array(b)) => {
            let common = a.len().min(b.len());
            let mut entries = Vec::new();
            for i in 0..common {
                if let Some(d) = diff(&a[i], &b[i]) {
                    entries.push((i, d));
                }
            }
            // Trailing removals descend so each remove targets the current tail.
            for i in (common..a.len()).rev() {
                entries.push((i, Delta::Remove(a[i].clone())));
            }
            for (i, item) in b.iter().enumerate().skip(common) {
                entries.push((i, Delta::Add(item.clone())));
            }
            Some(Delta::Array(entries))
        }
        _ => Some(Delta::Change(before.clone(), after.clone())),
    }
}

/// Apply a delta forward, turning the before-snapshot into the after-snapshot.
///
/// A delta applied to a value it was not computed against is best-effort:
/// mismatched container shapes are logged and replaced rather than panicking,
/// since a diagnostics consumer may feed back hand-edited deltas.
pub fn patch(target: &mut Value, delta: &Delta) {
    match delta {
        Delta::Add(v) | Delta::Change(_, v) => *target = v.clone(),
        Delta::Remove(_) => *target = Value::Null,
        Delta::Object(entries) => {
            let Value::Object(map) = target else {
                tracing::warn!("object delta applied to a non-object value");
                *target = Value::Object(serde_json::Map::new());
                let Value::Object(map) = target else {
                    unreachable!()
                };
                apply_object_entries(map, entries);
                return;
            };
            apply_object_entries(map, entries);
        }
        Delta::Array(entries) => {
            let Value::Array(items) = target else {
                tracing::warn!("array delta applied to a non-array value");
                *target = Value::Array(Vec::new());
                let Value::Array(items) = target else {
                    unreachable!()
                };
                apply_array_entries(items, entries);
                return;
            };
            apply_array_entries(items, entries);
        }
    }
}

/// Apply a delta in reverse, turning the after-snapshot back into the
/// before-snapshot.
pub fn unpatch(target: &mut Value, delta: &Delta) {
    patch(target, &delta.inverted());
}

fn apply_object_entries(map: &mut serde_json::Map<String, Value>, entries: &IndexMap<String, Delta>) {
    for (key, delta) in entries {
        match delta {
            Delta::Add(v) => {
                map.insert(key.clone(), v.clone());
            }
            Delta::Remove(_) => {
                map.remove(key);
            }
            other => match map.get_mut(key) {
                Some(slot) => patch(slot, other),
                None => {
                    // Tolerate a change aimed at a key that vanished; install
                    // the after-value so forward replay still converges.
                    tracing::warn!(key = %key, "delta change for a missing key");
                    let mut slot = Value::Null;
                    patch(&mut slot, other);
                    map.insert(key.clone(), slot);
                }
            },
        }
    }
}

fn apply_array_entries(items: &mut Vec<Value>, entries: &[(usize, Delta)]) {
    for (index, delta) in entries {
        match delta {
            Delta::Add(v) => {
                let at = (*index).min(items.len());
                items.insert(at, v.clone());
            }
            Delta::Remove(_) => {
                if *index < items.len() {
                    items.remove(*index);
                } else {
                    tracing::warn!(index = *index, "delta removal past the end of an array");
                }
            }
            other => match items.get_mut(*index) {
                Some(slot) => patch(slot, other),
                None => tracing::warn!(index = *index, "delta change past the end of an array"),
            },
        }
    }
}
