//! Observable handles over the state tree.
//!
//! A [`StateView`] scopes a path into one namespace. It never exposes the
//! backing value: `get`/`at` return freshly scoped views, `value()` returns a
//! deep clone, and every write is checked against the coordinator's
//! "mutation in progress" flag. Reads record dependency edges for the
//! innermost tracking scope; `value()` traverses the returned subtree and
//! records every nested key, so a watcher that derives from a container
//! re-fires when anything inside that container changes, not only when the
//! container itself is replaced.

use std::fmt::Write as _;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::reactive::{KEY_SEP, record_read, scope_active};
use crate::store::StoreInner;

/// One segment of a path into a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Seg {
    Key(String),
    Index(usize),
}

/// Live view of a property (or the root) of one namespace.
#[derive(Clone)]
pub struct StateView {
    inner: Arc<StoreInner>,
    namespace: String,
    path: Vec<Seg>,
}

impl StateView {
    pub(crate) fn root(inner: Arc<StoreInner>, namespace: String) -> Self {
        Self {
            inner,
            namespace,
            path: Vec::new(),
        }
    }

    /// The namespace this view belongs to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Scope one object property deeper. No read happens yet.
    pub fn get(&self, key: impl Into<String>) -> StateView {
        let mut path = self.path.clone();
        path.push(Seg::Key(key.into()));
        StateView {
            inner: Arc::clone(&self.inner),
            namespace: self.namespace.clone(),
            path,
        }
    }

    /// Scope one array element deeper. No read happens yet.
    pub fn at(&self, index: usize) -> StateView {
        let mut path = self.path.clone();
        path.push(Seg::Index(index));
        StateView {
            inner: Arc::clone(&self.inner),
            namespace: self.namespace.clone(),
            path,
        }
    }

    /// Read the value at this view as a deep clone.
    ///
    /// Returns `Value::Null` when the path (or the whole namespace) does not
    /// exist. The read is tracked: the view's own key and every nested key of
    /// the returned subtree become dependencies of the active watcher, if any.
    pub fn value(&self) -> Value {
        let value = {
            let state = self.inner.state.lock();
            state
                .get(&self.namespace)
                .and_then(|root| resolve(root, &self.path))
                .cloned()
        };
        let value = value.unwrap_or(Value::Null);
        if scope_active() {
            let key = self.property_key();
            record_read(&key);
            record_subtree_reads(&key, &value);
        }
        value
    }

    /// Write one object property under this view.
    pub fn set(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let key = key.into();
        self.authorize(&key)?;
        let trigger = {
            let mut state = self.inner.state.lock();
            let target = self.resolve_mut(&mut state)?;
            let Value::Object(map) = target else {
                return Err(self.type_mismatch("an object"));
            };
            map.insert(key.clone(), value);
            self.child_key(&Seg::Key(key))
        };
        crate::store::notify_write(&self.inner, &trigger);
        Ok(())
    }

    /// Remove one object property under this view.
    pub fn remove(&self, key: impl Into<String>) -> Result<()> {
        let key = key.into();
        self.authorize(&key)?;
        let trigger = {
            let mut state = self.inner.state.lock();
            let target = self.resolve_mut(&mut state)?;
            let Value::Object(map) = target else {
                return Err(self.type_mismatch("an object"));
            };
            if map.remove(&key).is_none() {
                return Err(StoreError::PathNotFound {
                    namespace: self.namespace.clone(),
                    path: join_display(&self.path, Some(&key)),
                });
            }
            self.child_key(&Seg::Key(key))
        };
        crate::store::notify_write(&self.inner, &trigger);
        Ok(())
    }

    /// Overwrite one array element under this view.
    pub fn set_index(&self, index: usize, value: Value) -> Result<()> {
        self.authorize(&index.to_string())?;
        let trigger = {
            let mut state = self.inner.state.lock();
            let target = self.resolve_mut(&mut state)?;
            let Value::Array(items) = target else {
                return Err(self.type_mismatch("an array"));
            };
            let Some(slot) = items.get_mut(index) else {
                return Err(StoreError::PathNotFound {
                    namespace: self.namespace.clone(),
                    path: join_display(&self.path, Some(&index.to_string())),
                });
            };
            *slot = value;
            self.child_key(&Seg::Index(index))
        };
        crate::store::notify_write(&self.inner, &trigger);
        Ok(())
    }

    /// Append to the array under this view.
    pub fn push(&self, value: Value) -> Result<()> {
        self.authorize("push")?;
        let trigger = {
            let mut state = self.inner.state.lock();
            let target = self.resolve_mut(&mut state)?;
            let Value::Array(items) = target else {
                return Err(self.type_mismatch("an array"));
            };
            items.push(value);
            self.child_key(&Seg::Index(items.len() - 1))
        };
        crate::store::notify_write(&self.inner, &trigger);
        Ok(())
    }

    /// Remove and return the last element of the array under this view.
    pub fn pop(&self) -> Result<Option<Value>> {
        self.authorize("pop")?;
        let (popped, trigger) = {
            let mut state = self.inner.state.lock();
            let target = self.resolve_mut(&mut state)?;
            let Value::Array(items) = target else {
                return Err(self.type_mismatch("an array"));
            };
            let popped = items.pop();
            let trigger = self.child_key(&Seg::Index(items.len()));
            (popped, trigger)
        };
        if popped.is_some() {
            crate::store::notify_write(&self.inner, &trigger);
        }
        Ok(popped)
    }

    /// The namespace-qualified dependency key of this view.
    pub(crate) fn property_key(&self) -> String {
        let mut key = self.namespace.clone();
        for seg in &self.path {
            key.push(KEY_SEP);
            match seg {
                Seg::Key(k) => key.push_str(k),
                Seg::Index(i) => {
                    let _ = write!(key, "{i}");
                }
            }
        }
        key
    }

    fn child_key(&self, seg: &Seg) -> String {
        let mut key = self.property_key();
        key.push(KEY_SEP);
        match seg {
            Seg::Key(k) => key.push_str(k),
            Seg::Index(i) => {
                let _ = write!(key, "{i}");
            }
        }
        key
    }

    fn authorize(&self, target: &str) -> Result<()> {
        if self.inner.coord.in_progress() {
            return Ok(());
        }
        Err(StoreError::UnauthorizedMutation {
            namespace: self.namespace.clone(),
            path: join_display(&self.path, Some(target)),
            trace: self
                .inner
                .options
                .capture_stack
                .then(|| std::backtrace::Backtrace::force_capture().to_string()),
        })
    }

    fn resolve_mut<'a>(
        &self,
        state: &'a mut indexmap::IndexMap<String, Value>,
    ) -> Result<&'a mut Value> {
        let mut current = state
            .get_mut(&self.namespace)
            .ok_or_else(|| StoreError::UnknownNamespace(self.namespace.clone()))?;
        for (depth, seg) in self.path.iter().enumerate() {
            let next = match (seg, &mut *current) {
                (Seg::Key(k), Value::Object(map)) => map.get_mut(k.as_str()),
                (Seg::Index(i), Value::Array(items)) => items.get_mut(*i),
                (Seg::Key(_), _) => return Err(self.type_mismatch_at(depth, "an object")),
                (Seg::Index(_), _) => return Err(self.type_mismatch_at(depth, "an array")),
            };
            current = next.ok_or_else(|| StoreError::PathNotFound {
                namespace: self.namespace.clone(),
                path: join_display(&self.path[..=depth], None),
            })?;
        }
        Ok(current)
    }

    fn type_mismatch(&self, expected: &'static str) -> StoreError {
        StoreError::TypeMismatch {
            namespace: self.namespace.clone(),
            path: join_display(&self.path, None),
            expected,
        }
    }

    fn type_mismatch_at(&self, depth: usize, expected: &'static str) -> StoreError {
        StoreError::TypeMismatch {
            namespace: self.namespace.clone(),
            path: join_display(&self.path[..depth], None),
            expected,
        }
    }
}

fn resolve<'a>(root: &'a Value, path: &[Seg]) -> Option<&'a Value> {
    let mut current = root;
    for seg in path {
        current = match (seg, current) {
            (Seg::Key(k), Value::Object(map)) => map.get(k.as_str())?,
            (Seg::Index(i), Value::Array(items)) => items.get(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Record reads for every nested key of a subtree, relative to `base`.
fn record_subtree_reads(base: &str, value: &Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_key = format!("{base}{KEY_SEP}{key}");
                record_read(&child_key);
                record_subtree_reads(&child_key, child);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                let child_key = format!("{base}{KEY_SEP}{index}");
                record_read(&child_key);
                record_subtree_reads(&child_key, child);
            }
        }
        _ => {}
    }
}

/// Human-readable path for error messages, e.g. `profile.tags[2].name`.
fn join_display(path: &[Seg], tail: Option<&str>) -> String {
    let mut out = String::new();
    for seg in path {
        match seg {
            Seg::Key(k) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(k);
            }
            Seg::Index(i) => {
                let _ = write!(out, "[{i}]");
            }
        }
    }
    if let Some(tail) = tail {
        if !out.is_empty() {
            out.push('.');
        }
        out.push_str(tail);
    }
    if out.is_empty() {
        out.push_str("(root)");
    }
    out
}
