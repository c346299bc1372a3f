//! Pending attribute operations and how they compose.
//!
//! An [`Operation`] is a mutation of one attribute that has not been
//! synchronized yet. Recording a second operation on the same key
//! merges it over the first, so at most one operation per key is ever
//! pending:
//!
//! | later \ pending | Set(x) | Unset | Increment | Add | AddUnique | Remove | Relation |
//! |---|---|---|---|---|---|---|---|
//! | Set / Unset | replace | replace | replace | replace | replace | replace | replace |
//! | Increment(a) | Set(x+a) if numeric | Set(a) | summed | ✗ | ✗ | ✗ | ✗ |
//! | Add(xs) | Set(x++xs) if array | Set(xs) | ✗ | appended | ✗ | ✗ | ✗ |
//! | AddUnique(xs) | Set(x∪xs) if array | Set(xs) | ✗ | ✗ | union | ✗ | ✗ |
//! | Remove(xs) | Set(x−xs) if array | Unset | ✗ | ✗ | ✗ | union | ✗ |
//! | Relation | ✗ | ✗ | ✗ | ✗ | ✗ | ✗ | net merge |
//!
//! ✗ is [`CoreError::IncompatibleOperation`].

use crate::error::{CoreError, CoreResult};
use nimbus_codec::{encode_pointer, from_wire, to_wire, CodecResult, Json, Pointer, Value};
use serde_json::json;
use std::collections::BTreeSet;

/// Pending changes to a relation: object ids to link and unlink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationChange {
    target_class: String,
    added: BTreeSet<String>,
    removed: BTreeSet<String>,
}

impl RelationChange {
    /// Links the given object ids.
    pub fn add<I, S>(target_class: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target_class: target_class.into(),
            added: ids.into_iter().map(Into::into).collect(),
            removed: BTreeSet::new(),
        }
    }

    /// Unlinks the given object ids.
    pub fn remove<I, S>(target_class: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            target_class: target_class.into(),
            added: BTreeSet::new(),
            removed: ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Class of the related objects.
    pub fn target_class(&self) -> &str {
        &self.target_class
    }

    /// Object ids to link.
    pub fn added(&self) -> &BTreeSet<String> {
        &self.added
    }

    /// Object ids to unlink.
    pub fn removed(&self) -> &BTreeSet<String> {
        &self.removed
    }

    /// True when the change links and unlinks nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Merges this change over an earlier pending one.
    ///
    /// Linking then unlinking the same id (or the reverse) cancels.
    fn merge_over(&self, key: &str, earlier: &RelationChange) -> CoreResult<RelationChange> {
        if self.target_class != earlier.target_class {
            return Err(CoreError::incompatible(
                key,
                format!("Relation({})", earlier.target_class),
                format!("Relation({})", self.target_class),
            ));
        }
        let added = earlier
            .added
            .difference(&self.removed)
            .chain(self.added.difference(&earlier.removed))
            .cloned()
            .collect();
        let removed = earlier
            .removed
            .difference(&self.added)
            .chain(self.removed.difference(&earlier.added))
            .cloned()
            .collect();
        Ok(RelationChange {
            target_class: self.target_class.clone(),
            added,
            removed,
        })
    }

    fn pointers(&self, ids: &BTreeSet<String>) -> Vec<Json> {
        ids.iter()
            .map(|id| encode_pointer(&Pointer::new(self.target_class.clone(), id.clone())))
            .collect()
    }
}

/// A pending mutation of a single attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Replace the value.
    Set(Value),
    /// Delete the key.
    Unset,
    /// Add a number to the current value.
    Increment(Value),
    /// Append values to an array.
    Add(Vec<Value>),
    /// Append values not already present in an array.
    AddUnique(Vec<Value>),
    /// Remove every occurrence of the values from an array.
    Remove(Vec<Value>),
    /// Link and unlink related objects.
    Relation(RelationChange),
}

impl Operation {
    /// Creates an increment, rejecting non-numeric amounts.
    pub fn increment(amount: impl Into<Value>) -> CoreResult<Self> {
        let amount = amount.into();
        if !amount.is_number() {
            return Err(CoreError::validation(format!(
                "increment amount must be a number, got {}",
                amount.kind_name()
            )));
        }
        Ok(Operation::Increment(amount))
    }

    /// Wire name of the operation.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Set(_) => "Set",
            Operation::Unset => "Delete",
            Operation::Increment(_) => "Increment",
            Operation::Add(_) => "Add",
            Operation::AddUnique(_) => "AddUnique",
            Operation::Remove(_) => "Remove",
            Operation::Relation(_) => "Relation",
        }
    }

    fn describe(&self) -> String {
        match self {
            Operation::Set(v) => format!("Set({})", v.kind_name()),
            Operation::Relation(r) => format!("Relation({})", r.target_class),
            other => other.name().to_string(),
        }
    }

    fn incompatible_with(&self, key: &str, earlier: &Operation) -> CoreError {
        CoreError::incompatible(key, earlier.describe(), self.name())
    }

    /// Merges this operation over the one already pending on `key`.
    ///
    /// Returns `Ok(None)` when the two cancel out and nothing should
    /// stay pending.
    pub fn merge_over(self, key: &str, earlier: Option<&Operation>) -> CoreResult<Option<Operation>> {
        let Some(earlier) = earlier else {
            return Ok(match self {
                Operation::Relation(ref r) if r.is_empty() => None,
                op => Some(op),
            });
        };
        if matches!(self, Operation::Set(_) | Operation::Unset) {
            return Ok(Some(self));
        }

        let merged = match (&self, earlier) {
            (Operation::Increment(a), Operation::Unset) => Operation::Set(a.clone()),
            (Operation::Increment(a), Operation::Set(v)) => Operation::Set(
                v.checked_add(a)
                    .ok_or_else(|| self.incompatible_with(key, earlier))?,
            ),
            (Operation::Increment(a), Operation::Increment(b)) => Operation::Increment(
                b.checked_add(a)
                    .ok_or_else(|| self.incompatible_with(key, earlier))?,
            ),
            (Operation::Add(xs), Operation::Unset) => Operation::Set(Value::Array(xs.clone())),
            (Operation::Add(xs), Operation::Set(Value::Array(ys))) => {
                Operation::Set(Value::Array(concat(ys, xs)))
            }
            (Operation::Add(xs), Operation::Add(ys)) => Operation::Add(concat(ys, xs)),
            (Operation::AddUnique(xs), Operation::Unset) => {
                Operation::Set(Value::Array(union(&[], xs)))
            }
            (Operation::AddUnique(xs), Operation::Set(Value::Array(ys))) => {
                Operation::Set(Value::Array(union(ys, xs)))
            }
            (Operation::AddUnique(xs), Operation::AddUnique(ys)) => {
                Operation::AddUnique(union(ys, xs))
            }
            (Operation::Remove(_), Operation::Unset) => Operation::Unset,
            (Operation::Remove(xs), Operation::Set(Value::Array(ys))) => {
                Operation::Set(Value::Array(without(ys, xs)))
            }
            (Operation::Remove(xs), Operation::Remove(ys)) => Operation::Remove(union(ys, xs)),
            (Operation::Relation(later), Operation::Relation(pending)) => {
                let merged = later.merge_over(key, pending)?;
                if merged.is_empty() {
                    return Ok(None);
                }
                Operation::Relation(merged)
            }
            _ => return Err(self.incompatible_with(key, earlier)),
        };
        Ok(Some(merged))
    }

    /// Computes the value `key` holds after this operation, given its
    /// current value. `None` means the key is absent.
    pub fn apply(&self, key: &str, current: Option<&Value>) -> CoreResult<Option<Value>> {
        let current = current.filter(|v| !v.is_null());
        let mismatch = |value: &Value| {
            CoreError::incompatible(key, format!("value({})", value.kind_name()), self.name())
        };
        Ok(match self {
            Operation::Set(v) => Some(v.clone()),
            Operation::Unset => None,
            Operation::Increment(amount) => match current {
                None => Some(amount.clone()),
                Some(v) => Some(v.checked_add(amount).ok_or_else(|| mismatch(v))?),
            },
            Operation::Add(xs) => match current {
                None => Some(Value::Array(xs.clone())),
                Some(Value::Array(ys)) => Some(Value::Array(concat(ys, xs))),
                Some(v) => return Err(mismatch(v)),
            },
            Operation::AddUnique(xs) => match current {
                None => Some(Value::Array(union(&[], xs))),
                Some(Value::Array(ys)) => Some(Value::Array(union(ys, xs))),
                Some(v) => return Err(mismatch(v)),
            },
            Operation::Remove(xs) => match current {
                None => Some(Value::Array(Vec::new())),
                Some(Value::Array(ys)) => Some(Value::Array(without(ys, xs))),
                Some(v) => return Err(mismatch(v)),
            },
            Operation::Relation(change) => match current {
                None => Some(Value::Relation(change.target_class.clone())),
                Some(Value::Relation(class)) if *class == change.target_class => {
                    Some(Value::Relation(class.clone()))
                }
                Some(v) => return Err(mismatch(v)),
            },
        })
    }

    /// Encodes the operation as a patch entry.
    pub fn to_wire(&self) -> CodecResult<Json> {
        let objects = |values: &[Value]| -> CodecResult<Json> {
            Ok(Json::Array(values.iter().map(to_wire).collect::<CodecResult<_>>()?))
        };
        Ok(match self {
            Operation::Set(v) => to_wire(v)?,
            Operation::Unset => json!({ "__op": "Delete" }),
            Operation::Increment(amount) => json!({ "__op": "Increment", "amount": to_wire(amount)? }),
            Operation::Add(xs) => json!({ "__op": "Add", "objects": objects(xs)? }),
            Operation::AddUnique(xs) => json!({ "__op": "AddUnique", "objects": objects(xs)? }),
            Operation::Remove(xs) => json!({ "__op": "Remove", "objects": objects(xs)? }),
            Operation::Relation(change) => {
                let add = json!({ "__op": "AddRelation", "objects": change.pointers(&change.added) });
                let remove =
                    json!({ "__op": "RemoveRelation", "objects": change.pointers(&change.removed) });
                match (change.added.is_empty(), change.removed.is_empty()) {
                    (false, true) => add,
                    (true, false) => remove,
                    _ => json!({ "__op": "Batch", "ops": [add, remove] }),
                }
            }
        })
    }

    /// Decodes a patch entry. Anything without an `__op` tag is a Set.
    pub fn from_wire(json: &Json) -> CoreResult<Self> {
        let Some(op) = json.get("__op").and_then(Json::as_str) else {
            return Ok(Operation::Set(from_wire(json)?));
        };
        let objects = || -> CoreResult<Vec<Value>> {
            json.get("objects")
                .and_then(Json::as_array)
                .ok_or_else(|| CoreError::validation(format!("{op} requires objects")))?
                .iter()
                .map(|v| from_wire(v).map_err(CoreError::from))
                .collect()
        };
        match op {
            "Delete" => Ok(Operation::Unset),
            "Increment" => {
                let amount = json
                    .get("amount")
                    .ok_or_else(|| CoreError::validation("Increment requires amount"))?;
                Operation::increment(from_wire(amount)?)
            }
            "Add" => Ok(Operation::Add(objects()?)),
            "AddUnique" => Ok(Operation::AddUnique(objects()?)),
            "Remove" => Ok(Operation::Remove(objects()?)),
            "AddRelation" | "RemoveRelation" => {
                let pointers = objects()?;
                let (class, ids) = relation_targets(&pointers)?;
                Ok(Operation::Relation(if op == "AddRelation" {
                    RelationChange::add(class, ids)
                } else {
                    RelationChange::remove(class, ids)
                }))
            }
            "Batch" => {
                let ops = json
                    .get("ops")
                    .and_then(Json::as_array)
                    .ok_or_else(|| CoreError::validation("Batch requires ops"))?;
                let mut merged: Option<Operation> = None;
                for entry in ops {
                    let next = Operation::from_wire(entry)?;
                    merged = next.merge_over("Batch", merged.as_ref())?;
                }
                merged.ok_or_else(|| CoreError::validation("empty Batch"))
            }
            other => Err(CoreError::validation(format!("unknown operation {other}"))),
        }
    }
}

fn relation_targets(pointers: &[Value]) -> CoreResult<(String, Vec<String>)> {
    let mut class: Option<&str> = None;
    let mut ids = Vec::with_capacity(pointers.len());
    for value in pointers {
        let pointer = value
            .as_pointer()
            .ok_or_else(|| CoreError::validation("relation objects must be pointers"))?;
        match class {
            Some(c) if c != pointer.class_name => {
                return Err(CoreError::validation("relation objects must share a class"))
            }
            _ => class = Some(pointer.class_name.as_str()),
        }
        ids.push(pointer.object_id.clone());
    }
    let class = class.ok_or_else(|| CoreError::validation("relation op without objects"))?;
    Ok((class.to_string(), ids))
}

fn contains(values: &[Value], needle: &Value) -> bool {
    values.iter().any(|v| v.loosely_equals(needle))
}

fn concat(base: &[Value], extra: &[Value]) -> Vec<Value> {
    base.iter().chain(extra).cloned().collect()
}

fn union(base: &[Value], extra: &[Value]) -> Vec<Value> {
    let mut out = base.to_vec();
    for value in extra {
        if !contains(&out, value) {
            out.push(value.clone());
        }
    }
    out
}

fn without(base: &[Value], removed: &[Value]) -> Vec<Value> {
    base.iter()
        .filter(|v| !contains(removed, v))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(values: &[i64]) -> Vec<Value> {
        values.iter().copied().map(Value::Integer).collect()
    }

    fn merge(later: Operation, earlier: &Operation) -> CoreResult<Option<Operation>> {
        later.merge_over("k", Some(earlier))
    }

    #[test]
    fn increments_sum() {
        let merged = merge(
            Operation::increment(3).unwrap(),
            &Operation::increment(4).unwrap(),
        )
        .unwrap();
        assert_eq!(merged, Some(Operation::Increment(Value::Integer(7))));
    }

    #[test]
    fn increment_after_numeric_set_folds() {
        let merged = merge(
            Operation::increment(2).unwrap(),
            &Operation::Set(Value::Integer(10)),
        )
        .unwrap();
        assert_eq!(merged, Some(Operation::Set(Value::Integer(12))));
    }

    #[test]
    fn increment_after_text_set_fails() {
        let err = merge(
            Operation::increment(1).unwrap(),
            &Operation::Set(Value::from("ten")),
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::IncompatibleOperation { .. }));
    }

    #[test]
    fn increment_requires_number() {
        assert!(Operation::increment("one").is_err());
        assert!(Operation::increment(1.5).is_ok());
    }

    #[test]
    fn set_replaces_anything() {
        let merged = merge(Operation::Set(Value::from("x")), &Operation::Add(ints(&[1]))).unwrap();
        assert_eq!(merged, Some(Operation::Set(Value::from("x"))));
        let merged = merge(Operation::Unset, &Operation::increment(1).unwrap()).unwrap();
        assert_eq!(merged, Some(Operation::Unset));
    }

    #[test]
    fn array_ops_merge() {
        assert_eq!(
            merge(Operation::Add(ints(&[3])), &Operation::Add(ints(&[1, 2]))).unwrap(),
            Some(Operation::Add(ints(&[1, 2, 3])))
        );
        assert_eq!(
            merge(
                Operation::AddUnique(ints(&[2, 3])),
                &Operation::AddUnique(ints(&[1, 2]))
            )
            .unwrap(),
            Some(Operation::AddUnique(ints(&[1, 2, 3])))
        );
        assert_eq!(
            merge(
                Operation::Remove(ints(&[2])),
                &Operation::Set(Value::Array(ints(&[1, 2, 2, 3])))
            )
            .unwrap(),
            Some(Operation::Set(Value::Array(ints(&[1, 3]))))
        );
        assert_eq!(
            merge(Operation::Remove(ints(&[2])), &Operation::Unset).unwrap(),
            Some(Operation::Unset)
        );
    }

    #[test]
    fn mixed_array_ops_are_incompatible() {
        assert!(merge(Operation::Remove(ints(&[1])), &Operation::Add(ints(&[1]))).is_err());
        assert!(merge(Operation::Add(ints(&[1])), &Operation::AddUnique(ints(&[1]))).is_err());
        assert!(merge(
            Operation::Add(ints(&[1])),
            &Operation::Set(Value::from("not an array"))
        )
        .is_err());
    }

    #[test]
    fn relation_add_then_remove_cancels() {
        let added = Operation::Relation(RelationChange::add("Player", ["p1"]));
        let removed = Operation::Relation(RelationChange::remove("Player", ["p1"]));
        assert_eq!(removed.merge_over("members", Some(&added)).unwrap(), None);
    }

    #[test]
    fn relation_remove_then_add_cancels() {
        let removed = Operation::Relation(RelationChange::remove("Player", ["p1"]));
        let added = Operation::Relation(RelationChange::add("Player", ["p1"]));
        assert_eq!(added.merge_over("members", Some(&removed)).unwrap(), None);
    }

    #[test]
    fn relation_partial_cancel_keeps_the_rest() {
        let added = Operation::Relation(RelationChange::add("Player", ["p1", "p2"]));
        let removed = Operation::Relation(RelationChange::remove("Player", ["p1", "p3"]));
        let merged = removed.merge_over("members", Some(&added)).unwrap().unwrap();
        let Operation::Relation(change) = merged else {
            panic!("expected relation");
        };
        assert_eq!(change.added().iter().collect::<Vec<_>>(), vec!["p2"]);
        assert_eq!(change.removed().iter().collect::<Vec<_>>(), vec!["p3"]);
    }

    #[test]
    fn relation_class_mismatch_fails() {
        let players = Operation::Relation(RelationChange::add("Player", ["p1"]));
        let teams = Operation::Relation(RelationChange::add("Team", ["t1"]));
        assert!(teams.merge_over("members", Some(&players)).is_err());
    }

    #[test]
    fn apply_estimates_values() {
        let op = Operation::increment(5).unwrap();
        assert_eq!(op.apply("k", None).unwrap(), Some(Value::Integer(5)));
        assert_eq!(
            op.apply("k", Some(&Value::Integer(1))).unwrap(),
            Some(Value::Integer(6))
        );
        assert!(op.apply("k", Some(&Value::from("x"))).is_err());

        let op = Operation::Remove(ints(&[1]));
        assert_eq!(op.apply("k", None).unwrap(), Some(Value::Array(vec![])));
        assert_eq!(Operation::Unset.apply("k", Some(&Value::Integer(1))).unwrap(), None);
    }

    #[test]
    fn encodes_patch_entries() {
        assert_eq!(
            Operation::increment(2).unwrap().to_wire().unwrap(),
            json!({ "__op": "Increment", "amount": 2 })
        );
        assert_eq!(Operation::Unset.to_wire().unwrap(), json!({ "__op": "Delete" }));
        assert_eq!(
            Operation::AddUnique(ints(&[1])).to_wire().unwrap(),
            json!({ "__op": "AddUnique", "objects": [1] })
        );
    }

    #[test]
    fn relation_with_both_sides_encodes_as_batch() {
        let add = Operation::Relation(RelationChange::add("Player", ["p1"]));
        let both = Operation::Relation(RelationChange::remove("Player", ["p2"]))
            .merge_over("members", Some(&add))
            .unwrap()
            .unwrap();
        let wire = both.to_wire().unwrap();
        assert_eq!(wire["__op"], "Batch");
        assert_eq!(wire["ops"][0]["__op"], "AddRelation");
        assert_eq!(wire["ops"][1]["objects"][0]["objectId"], "p2");

        assert_eq!(Operation::from_wire(&wire).unwrap(), both);
    }

    #[test]
    fn decodes_plain_json_as_set() {
        assert_eq!(
            Operation::from_wire(&json!("hello")).unwrap(),
            Operation::Set(Value::from("hello"))
        );
        assert!(Operation::from_wire(&json!({ "__op": "Explode" })).is_err());
    }
}
