//! Per-entity attribute store with clean/current snapshots.
//!
//! The store keeps two maps:
//! - `clean`: the last server-confirmed values (what `previous` returns)
//! - `current`: what the application sees, including local edits
//!
//! A key is dirty while its current value differs from the clean one,
//! or while it was explicitly marked dirty (relations and ACLs, whose
//! local value does not reflect the pending change).

use nimbus_codec::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Attribute snapshots and dirty flags for one entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeStore {
    current: BTreeMap<String, Value>,
    clean: BTreeMap<String, Value>,
    dirty: BTreeSet<String>,
}

impl AttributeStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store whose values are all server-confirmed.
    pub fn from_clean(values: BTreeMap<String, Value>) -> Self {
        Self {
            current: values.clone(),
            clean: values,
            dirty: BTreeSet::new(),
        }
    }

    /// Gets the current value of a key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.current.get(key)
    }

    /// Returns true if the key currently has a value.
    pub fn has(&self, key: &str) -> bool {
        self.current.get(key).is_some_and(|v| !v.is_null())
    }

    /// All current values.
    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.current
    }

    /// Sets a value. Returns whether the key is now dirty.
    ///
    /// Setting a key back to its clean value clears the dirty flag.
    pub fn set(&mut self, key: &str, value: Value) -> bool {
        self.put(key, Some(value))
    }

    /// Removes a value. Returns whether the key is now dirty.
    pub fn unset(&mut self, key: &str) -> bool {
        self.put(key, None)
    }

    /// Sets (`Some`) or removes (`None`) a value, updating the dirty flag.
    pub fn put(&mut self, key: &str, value: Option<Value>) -> bool {
        match value {
            Some(v) => {
                self.current.insert(key.to_string(), v);
            }
            None => {
                self.current.remove(key);
            }
        }
        let is_dirty = self.current.get(key) != self.clean.get(key);
        if is_dirty {
            self.dirty.insert(key.to_string());
        } else {
            self.dirty.remove(key);
        }
        is_dirty
    }

    /// Marks a key dirty regardless of its value.
    pub fn mark_dirty(&mut self, key: &str) {
        self.dirty.insert(key.to_string());
    }

    /// Returns true if the key has unsynchronized changes.
    pub fn dirty(&self, key: &str) -> bool {
        self.dirty.contains(key)
    }

    /// Keys with unsynchronized changes, sorted.
    pub fn dirty_keys(&self) -> Vec<String> {
        self.dirty.iter().cloned().collect()
    }

    /// Returns true if any key is dirty.
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Value of the key at the last save/fetch boundary.
    pub fn previous(&self, key: &str) -> Option<&Value> {
        self.clean.get(key)
    }

    /// All values at the last save/fetch boundary.
    pub fn previous_attributes(&self) -> &BTreeMap<String, Value> {
        &self.clean
    }

    /// Restores one key to its clean value.
    pub fn revert(&mut self, key: &str) {
        match self.clean.get(key) {
            Some(v) => {
                self.current.insert(key.to_string(), v.clone());
            }
            None => {
                self.current.remove(key);
            }
        }
        self.dirty.remove(key);
    }

    /// Restores every key to its clean value.
    pub fn revert_all(&mut self) {
        self.current = self.clean.clone();
        self.dirty.clear();
    }

    /// Records a server-confirmed value for one key, replacing both
    /// snapshots and clearing its dirty flag.
    pub fn commit(&mut self, key: &str, value: Option<Value>) {
        match value {
            Some(v) => {
                self.clean.insert(key.to_string(), v.clone());
                self.current.insert(key.to_string(), v);
            }
            None => {
                self.clean.remove(key);
                self.current.remove(key);
            }
        }
        self.dirty.remove(key);
    }

    /// Records a server-confirmed value for a key that still has local
    /// changes. The current value becomes `estimate` and the key stays
    /// dirty.
    pub fn rebase(&mut self, key: &str, clean: Option<Value>, estimate: Option<Value>) {
        match clean {
            Some(v) => {
                self.clean.insert(key.to_string(), v);
            }
            None => {
                self.clean.remove(key);
            }
        }
        match estimate {
            Some(v) => {
                self.current.insert(key.to_string(), v);
            }
            None => {
                self.current.remove(key);
            }
        }
        self.dirty.insert(key.to_string());
    }

    /// Keys present in the clean snapshot.
    pub fn clean_keys(&self) -> Vec<String> {
        self.clean.keys().cloned().collect()
    }
}
