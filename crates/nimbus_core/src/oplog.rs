//! Operation log: pending operations per attribute key.
//!
//! The log holds at most one pending [`Operation`] per key. Saving
//! freezes the pending set into an in-flight batch and starts a fresh
//! one, so edits made while a save is outstanding are queued for the
//! next save instead of being lost or sent twice.
//!
//! ## Lifecycle of a batch
//!
//! 1. `record` composes operations into the pending set
//! 2. `freeze` hands the pending set to a save and marks its keys in flight
//! 3. `settle` (success) or `restore` (failure) releases the keys;
//!    `restore` composes the failed batch back under newer pending ops

use crate::error::CoreResult;
use crate::operation::Operation;
use nimbus_codec::{CodecResult, Json, Value};
use serde_json::Map;
use std::collections::BTreeMap;
use tracing::debug;

/// A set of operations keyed by attribute, in key order.
pub type OperationSet = BTreeMap<String, Operation>;

/// Pending and in-flight operations of one entity.
#[derive(Debug, Clone, Default)]
pub struct OperationLog {
    pending: OperationSet,
    in_flight: BTreeMap<String, usize>,
}

impl OperationLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Composes `op` with whatever is pending on `key`.
    ///
    /// On error the log is unchanged. If the composition cancels out
    /// (a relation link undone before save), the key is removed.
    pub fn record(&mut self, key: &str, op: Operation) -> CoreResult<()> {
        match op.merge_over(key, self.pending.get(key))? {
            Some(merged) => {
                self.pending.insert(key.to_string(), merged);
            }
            None => {
                self.pending.remove(key);
            }
        }
        Ok(())
    }

    /// Drops the pending operation on `key`, if any.
    pub fn discard(&mut self, key: &str) -> Option<Operation> {
        self.pending.remove(key)
    }

    /// Pending operation on `key`.
    pub fn pending(&self, key: &str) -> Option<&Operation> {
        self.pending.get(key)
    }

    /// Keys with pending operations, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.pending.keys().cloned().collect()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Number of keys with pending operations.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if a save carrying `key` has not completed yet.
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.in_flight.contains_key(key)
    }

    /// Returns true if any save is outstanding.
    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Compiles pending operations into a patch body.
    ///
    /// Pure and deterministic: keys come out sorted and the log is not
    /// modified.
    pub fn compile(&self) -> CodecResult<Map<String, Json>> {
        compile_set(&self.pending)
    }

    /// Removes pending operations for the given keys.
    pub fn clear<S: AsRef<str>>(&mut self, keys: &[S]) {
        for key in keys {
            self.pending.remove(key.as_ref());
        }
    }

    /// Removes every pending operation.
    pub fn clear_all(&mut self) {
        self.pending.clear();
    }

    /// Takes the pending set for sending and marks its keys in flight.
    pub fn freeze(&mut self) -> OperationSet {
        let batch = std::mem::take(&mut self.pending);
        for key in batch.keys() {
            *self.in_flight.entry(key.clone()).or_insert(0) += 1;
        }
        batch
    }

    /// Releases the keys of a batch that the server accepted.
    pub fn settle(&mut self, batch: &OperationSet) {
        for key in batch.keys() {
            self.release(key);
        }
    }

    /// Puts a rejected batch back under the operations recorded since
    /// it was frozen, so the next save sends both.
    ///
    /// When a newer operation cannot be composed over the restored one
    /// (e.g. `Remove` after `Add`), the pair collapses into a `Set` of
    /// `current(key)`, the value the application already sees.
    pub fn restore<F>(&mut self, batch: OperationSet, current: F)
    where
        F: Fn(&str) -> Option<Value>,
    {
        for (key, earlier) in batch {
            self.release(&key);
            let combined = match self.pending.remove(&key) {
                None => Some(earlier),
                Some(later) => match later.merge_over(&key, Some(&earlier)) {
                    Ok(merged) => merged,
                    Err(err) => {
                        debug!(key = %key, error = %err, "collapsing restored operation into a set");
                        Some(match current(&key) {
                            Some(value) => Operation::Set(value),
                            None => Operation::Unset,
                        })
                    }
                },
            };
            if let Some(op) = combined {
                self.pending.insert(key, op);
            }
        }
    }

    fn release(&mut self, key: &str) {
        if let Some(count) = self.in_flight.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.in_flight.remove(key);
            }
        }
    }
}

/// Compiles any operation set into a patch body.
pub fn compile_set(ops: &OperationSet) -> CodecResult<Map<String, Json>> {
    let mut body = Map::new();
    for (key, op) in ops {
        body.insert(key.clone(), op.to_wire()?);
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::operation::RelationChange;
    use serde_json::json;

    #[test]
    fn increments_collapse_into_one_entry() {
        let mut log = OperationLog::new();
        log.record("score", Operation::increment(2).unwrap()).unwrap();
        log.record("score", Operation::increment(3).unwrap()).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(
            Json::Object(log.compile().unwrap()),
            json!({ "score": { "__op": "Increment", "amount": 5 } })
        );
    }

    #[test]
    fn incompatible_record_leaves_log_unchanged() {
        let mut log = OperationLog::new();
        log.record("score", Operation::Set(Value::from("high"))).unwrap();
        let before = log.pending("score").cloned();
        let err = log
            .record("score", Operation::increment(1).unwrap())
            .unwrap_err();
        assert!(matches!(err, CoreError::IncompatibleOperation { .. }));
        assert_eq!(log.pending("score").cloned(), before);
    }

    #[test]
    fn cancelling_relation_ops_remove_the_key() {
        let mut log = OperationLog::new();
        log.record(
            "members",
            Operation::Relation(RelationChange::add("Player", ["p1"])),
        )
        .unwrap();
        log.record(
            "members",
            Operation::Relation(RelationChange::remove("Player", ["p1"])),
        )
        .unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn compile_is_sorted_and_pure() {
        let mut log = OperationLog::new();
        log.record("zeta", Operation::Unset).unwrap();
        log.record("alpha", Operation::Set(Value::Integer(1))).unwrap();
        let first = log.compile().unwrap();
        let second = log.compile().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.keys().collect::<Vec<_>>(), vec!["alpha", "zeta"]);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn clear_removes_selected_keys() {
        let mut log = OperationLog::new();
        log.record("a", Operation::Unset).unwrap();
        log.record("b", Operation::Unset).unwrap();
        log.clear(&["a"]);
        assert_eq!(log.keys(), vec!["b".to_string()]);
    }

    #[test]
    fn freeze_starts_a_new_set() {
        let mut log = OperationLog::new();
        log.record("a", Operation::Set(Value::Integer(1))).unwrap();
        let batch = log.freeze();
        assert!(log.is_empty());
        assert!(log.is_in_flight("a"));

        log.record("b", Operation::Set(Value::Integer(2))).unwrap();
        assert_eq!(log.keys(), vec!["b".to_string()]);

        log.settle(&batch);
        assert!(!log.has_in_flight());
        assert_eq!(log.keys(), vec!["b".to_string()]);
    }

    #[test]
    fn restore_composes_under_newer_ops() {
        let mut log = OperationLog::new();
        log.record("score", Operation::increment(1).unwrap()).unwrap();
        let batch = log.freeze();
        log.record("score", Operation::increment(4).unwrap()).unwrap();
        log.restore(batch, |_| None);
        assert!(!log.has_in_flight());
        assert_eq!(
            log.pending("score"),
            Some(&Operation::Increment(Value::Integer(5)))
        );
    }

    #[test]
    fn restore_collapses_incompatible_pairs() {
        let mut log = OperationLog::new();
        log.record("tags", Operation::Add(vec![Value::from("a")])).unwrap();
        let batch = log.freeze();
        log.record("tags", Operation::Remove(vec![Value::from("b")])).unwrap();
        log.restore(batch, |_| Some(Value::Array(vec![Value::from("a")])));
        assert_eq!(
            log.pending("tags"),
            Some(&Operation::Set(Value::Array(vec![Value::from("a")])))
        );
    }
}
