//! Optional per-namespace persistence.
//!
//! The store consumes a key-value capability and keeps one JSON-serialized
//! entry per persistent namespace. On creation, stored state hydrates the
//! initial value, but only properties present in the initial shape survive;
//! properties that no longer exist in the code are dropped, which caps
//! unbounded growth of stale persisted fields across versions.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;

/// Key-value storage consumed by the store for namespace persistence.
///
/// The contract is deliberately minimal so hosts can plug in whatever they
/// have: a browser localStorage bridge, a file-backed map, a test double.
pub trait StorageBackend: Send + Sync {
    /// Fetch a stored entry.
    fn get_item(&self, key: &str) -> Option<String>;
    /// Store an entry, replacing any previous value.
    fn set_item(&self, key: &str, value: String);
    /// Remove an entry.
    fn remove_item(&self, key: &str);
}

/// Derived storage key for a namespace without an explicit override.
pub(crate) fn storage_key(namespace: &str) -> String {
    format!("chronik:{namespace}")
}

/// Hydrate `initial` from storage, keeping only properties the initial shape
/// already has.
pub(crate) fn hydrate(storage: &dyn StorageBackend, key: &str, initial: &mut Value) {
    let Some(stored) = storage.get_item(key) else {
        return;
    };
    let stored: Value = match serde_json::from_str(&stored) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(key, %error, "ignoring unparseable persisted state");
            return;
        }
    };
    match (initial, stored) {
        (Value::Object(initial), Value::Object(stored)) => {
            for (name, value) in stored {
                if initial.contains_key(&name) {
                    initial.insert(name, value);
                } else {
                    tracing::debug!(key, property = %name, "dropping stale persisted property");
                }
            }
        }
        (initial, stored) => *initial = stored,
    }
}

/// Serialize and store one namespace value.
pub(crate) fn persist(storage: &dyn StorageBackend, key: &str, value: &Value) {
    match serde_json::to_string(value) {
        Ok(serialized) => storage.set_item(key, serialized),
        Err(error) => tracing::warn!(key, %error, "failed to serialize namespace for persistence"),
    }
}

/// In-memory [`StorageBackend`], mainly for tests and examples.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    /// An empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seed an entry, bypassing serialization.
    pub fn seed(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.lock().insert(key.into(), value.into());
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl StorageBackend for MemoryStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: String) {
        self.entries.lock().insert(key.to_owned(), value);
    }

    fn remove_item(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hydration_keeps_only_known_properties() {
        let storage = MemoryStorage::new();
        storage.seed("chronik:app", r#"{"count": 7, "ghost": true}"#);

        let mut initial = json!({"count": 0, "label": "fresh"});
        hydrate(&storage, "chronik:app", &mut initial);

        assert_eq!(initial, json!({"count": 7, "label": "fresh"}));
    }

    #[test]
    fn unparseable_entries_are_ignored() {
        let storage = MemoryStorage::new();
        storage.seed("chronik:app", "{not json");

        let mut initial = json!({"count": 0});
        hydrate(&storage, "chronik:app", &mut initial);
        assert_eq!(initial, json!({"count": 0}));
    }

    #[test]
    fn persist_round_trips_through_get_item() {
        let storage = MemoryStorage::new();
        persist(&storage, "chronik:app", &json!({"a": [1, 2]}));

        let mut hydrated = json!({"a": null});
        hydrate(&storage, "chronik:app", &mut hydrated);
        assert_eq!(hydrated, json!({"a": [1, 2]}));
    }
}
