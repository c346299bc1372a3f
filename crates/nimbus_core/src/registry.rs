//! Class registry: per-class defaults and attribute kinds.
//!
//! Registering a class is optional. Entities of registered classes get
//! their defaults applied on creation, and writes to registered keys
//! are type-checked before anything is recorded.

use crate::error::{CoreError, CoreResult};
use crate::keys::{validate_class_name, validate_writable_key};
use nimbus_codec::Value;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Kind of value a registered key accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Any value.
    Any,
    /// Boolean.
    Bool,
    /// Integer or float.
    Number,
    /// Text.
    Text,
    /// Bytes.
    Bytes,
    /// Timestamp.
    Date,
    /// Array.
    Array,
    /// Nested object.
    Object,
    /// Pointer to the named class, or any class when `None`.
    Pointer,
    /// Geo point.
    GeoPoint,
    /// File.
    File,
    /// Relation.
    Relation,
}

impl ValueKind {
    /// Returns true if `value` is acceptable for this kind.
    ///
    /// Null is accepted everywhere; it is how a key is cleared.
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) | (ValueKind::Any, _) => true,
            (ValueKind::Bool, Value::Bool(_)) => true,
            (ValueKind::Number, v) => v.is_number(),
            (ValueKind::Text, Value::Text(_)) => true,
            (ValueKind::Bytes, Value::Bytes(_)) => true,
            (ValueKind::Date, Value::Date(_)) => true,
            (ValueKind::Array, Value::Array(_)) => true,
            (ValueKind::Object, Value::Object(_)) => true,
            (ValueKind::Pointer, Value::Pointer(_)) => true,
            (ValueKind::GeoPoint, Value::GeoPoint(_)) => true,
            (ValueKind::File, Value::File(_)) => true,
            (ValueKind::Relation, Value::Relation(_)) => true,
            _ => false,
        }
    }
}

/// Registration of one class.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassSpec {
    name: String,
    defaults: BTreeMap<String, Value>,
    fields: BTreeMap<String, ValueKind>,
}

impl ClassSpec {
    /// Starts a registration for `name`.
    pub fn new(name: impl Into<String>) -> CoreResult<Self> {
        let name = name.into();
        validate_class_name(&name)?;
        Ok(Self {
            name,
            defaults: BTreeMap::new(),
            fields: BTreeMap::new(),
        })
    }

    /// Declares the kind of a key.
    pub fn with_field(mut self, key: impl Into<String>, kind: ValueKind) -> CoreResult<Self> {
        let key = key.into();
        validate_writable_key(&key)?;
        self.fields.insert(key, kind);
        Ok(self)
    }

    /// Declares a default applied to new entities.
    pub fn with_default(mut self, key: impl Into<String>, value: impl Into<Value>) -> CoreResult<Self> {
        let key = key.into();
        let value = value.into();
        validate_writable_key(&key)?;
        self.check(&key, &value)?;
        self.defaults.insert(key, value);
        Ok(self)
    }

    /// Class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Defaults for new entities.
    pub fn defaults(&self) -> &BTreeMap<String, Value> {
        &self.defaults
    }

    /// Declared kind of a key.
    pub fn field(&self, key: &str) -> Option<ValueKind> {
        self.fields.get(key).copied()
    }

    /// Checks a value against the declared kind of `key`.
    /// Undeclared keys accept anything.
    pub fn check(&self, key: &str, value: &Value) -> CoreResult<()> {
        match self.fields.get(key) {
            Some(kind) if !kind.accepts(value) => Err(CoreError::validation(format!(
                "{}.{key} expects {kind:?}, got {}",
                self.name,
                value.kind_name()
            ))),
            _ => Ok(()),
        }
    }
}

/// Registered classes, shared by every entity of a client.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: RwLock<HashMap<String, Arc<ClassSpec>>>,
}

impl ClassRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a class.
    pub fn register(&self, spec: ClassSpec) {
        debug!(class = %spec.name, fields = spec.fields.len(), "registering class");
        self.classes
            .write()
            .insert(spec.name.clone(), Arc::new(spec));
    }

    /// Registration of a class, if any.
    pub fn get(&self, name: &str) -> Option<Arc<ClassSpec>> {
        self.classes.read().get(name).cloned()
    }

    /// Returns true if the class is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.classes.read().contains_key(name)
    }

    /// Checks a write against the class registration, if any.
    pub fn check(&self, class_name: &str, key: &str, value: &Value) -> CoreResult<()> {
        match self.get(class_name) {
            Some(spec) => spec.check(key, value),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game_score() -> ClassSpec {
        ClassSpec::new("GameScore")
            .unwrap()
            .with_field("score", ValueKind::Number)
            .unwrap()
            .with_field("player", ValueKind::Text)
            .unwrap()
            .with_default("score", 0)
            .unwrap()
    }

    #[test]
    fn registers_and_looks_up() {
        let registry = ClassRegistry::new();
        assert!(!registry.contains("GameScore"));
        registry.register(game_score());
        let spec = registry.get("GameScore").unwrap();
        assert_eq!(spec.defaults().get("score"), Some(&Value::Integer(0)));
        assert_eq!(spec.field("player"), Some(ValueKind::Text));
    }

    #[test]
    fn type_checks_registered_keys() {
        let registry = ClassRegistry::new();
        registry.register(game_score());
        assert!(registry.check("GameScore", "score", &Value::Float(1.5)).is_ok());
        assert!(registry.check("GameScore", "score", &Value::Null).is_ok());
        let err = registry
            .check("GameScore", "score", &Value::from("high"))
            .unwrap_err();
        assert!(err.is_validation());
        assert!(registry.check("GameScore", "other", &Value::from("x")).is_ok());
        assert!(registry.check("Unknown", "score", &Value::from("x")).is_ok());
    }

    #[test]
    fn defaults_must_match_fields() {
        let spec = ClassSpec::new("GameScore")
            .unwrap()
            .with_field("score", ValueKind::Number)
            .unwrap();
        assert!(spec.with_default("score", "zero").is_err());
    }

    #[test]
    fn rejects_bad_names() {
        assert!(ClassSpec::new("Game Score").is_err());
        assert!(ClassSpec::new("Game").unwrap().with_field("objectId", ValueKind::Text).is_err());
    }
}
