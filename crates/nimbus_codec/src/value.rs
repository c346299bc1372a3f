//! Dynamic attribute value type.

use crate::geo::GeoPoint;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A reference to a remote record: class name plus object id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pointer {
    /// Class the target belongs to.
    pub class_name: String,
    /// Server-assigned id of the target.
    pub object_id: String,
}

impl Pointer {
    /// Creates a pointer.
    pub fn new(class_name: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            object_id: object_id.into(),
        }
    }
}

/// A saved file as it appears inside an attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// Server-side file name.
    pub name: String,
    /// Download URL, when the server returned one.
    pub url: Option<String>,
}

/// A dynamic attribute value.
///
/// Every value an entity attribute, a query constraint or an operation
/// payload can hold. `Object` maps keep their keys sorted so encoding
/// is deterministic.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Finite double.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes (`Bytes` on the wire, base64 encoded).
    Bytes(Vec<u8>),
    /// UTC timestamp.
    Date(DateTime<Utc>),
    /// Ordered array of values.
    Array(Vec<Value>),
    /// Nested key/value map.
    Object(BTreeMap<String, Value>),
    /// Reference to another record.
    Pointer(Pointer),
    /// Latitude/longitude pair.
    GeoPoint(GeoPoint),
    /// Saved file reference.
    File(FileDescriptor),
    /// Relation marker naming the target class.
    Relation(String),
}

impl Value {
    /// Builds an object value from key/value pairs.
    pub fn object<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns true for integers and floats.
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Integer(_) | Value::Float(_))
    }

    /// Get this value as a boolean, if it is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get this value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get any numeric value as a float.
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Get this value as a string, if it is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get this value as bytes, if it is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get this value as a timestamp, if it is a date.
    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Get this value as an array, if it is one.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    /// Get this value as a map, if it is one.
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    /// Get this value as a pointer, if it is one.
    pub fn as_pointer(&self) -> Option<&Pointer> {
        match self {
            Value::Pointer(p) => Some(p),
            _ => None,
        }
    }

    /// Get this value as a geo point, if it is one.
    pub fn as_geo_point(&self) -> Option<GeoPoint> {
        match self {
            Value::GeoPoint(p) => Some(*p),
            _ => None,
        }
    }

    /// Look up a key in an object value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|m| m.get(key))
    }

    /// Short name of the variant, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Date(_) => "date",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Pointer(_) => "pointer",
            Value::GeoPoint(_) => "geopoint",
            Value::File(_) => "file",
            Value::Relation(_) => "relation",
        }
    }

    /// Adds two numeric values, keeping integers exact when possible.
    ///
    /// Returns `None` if either side is not a number.
    #[allow(clippy::cast_precision_loss)]
    pub fn checked_add(&self, other: &Value) -> Option<Value> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => Some(match a.checked_add(*b) {
                Some(sum) => Value::Integer(sum),
                None => Value::Float(*a as f64 + *b as f64),
            }),
            _ => Some(Value::Float(self.as_f64()? + other.as_f64()?)),
        }
    }

    /// Orders two values of comparable kinds.
    ///
    /// Numbers compare numerically across integer/float, text
    /// lexicographically, dates chronologically, booleans false < true.
    /// Values of different kinds are incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (a, b) if a.is_number() && b.is_number() => match (a, b) {
                (Value::Integer(x), Value::Integer(y)) => Some(x.cmp(y)),
                _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
            },
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            _ => None,
        }
    }

    /// Equality that treats `1` and `1.0` as the same number.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        if self.is_number() && other.is_number() {
            return self.compare(other) == Some(Ordering::Equal);
        }
        self == other
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Integer(i64::from(n))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::Date(d)
    }
}

impl From<Pointer> for Value {
    fn from(p: Pointer) -> Self {
        Value::Pointer(p)
    }
}

impl From<GeoPoint> for Value {
    fn from(p: GeoPoint) -> Self {
        Value::GeoPoint(p)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(m: BTreeMap<String, Value>) -> Self {
        Value::Object(m)
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Value::Null
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_are_sorted() {
        let value = Value::object([
            ("z", Value::Integer(1)),
            ("a", Value::Integer(2)),
            ("m", Value::Integer(3)),
        ]);
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["a", "m", "z"]);
    }

    #[test]
    fn numbers_compare_across_kinds() {
        assert_eq!(
            Value::Integer(2).compare(&Value::Float(2.5)),
            Some(Ordering::Less)
        );
        assert!(Value::Integer(3).loosely_equals(&Value::Float(3.0)));
        assert_ne!(Value::Integer(3), Value::Float(3.0));
        assert_eq!(Value::Text("a".into()).compare(&Value::Integer(1)), None);
    }

    #[test]
    fn checked_add_promotes_on_overflow() {
        assert_eq!(
            Value::Integer(2).checked_add(&Value::Integer(3)),
            Some(Value::Integer(5))
        );
        assert_eq!(
            Value::Integer(2).checked_add(&Value::Float(0.5)),
            Some(Value::Float(2.5))
        );
        assert!(matches!(
            Value::Integer(i64::MAX).checked_add(&Value::Integer(1)),
            Some(Value::Float(_))
        ));
        assert_eq!(Value::Text("x".into()).checked_add(&Value::Integer(1)), None);
    }

    #[test]
    fn value_accessors() {
        assert!(Value::Null.is_null());
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Integer(42).as_integer(), Some(42));
        assert_eq!(Value::Integer(42).as_f64(), Some(42.0));
        assert_eq!(Value::Text("hello".into()).as_text(), Some("hello"));
        assert_eq!(Value::Bytes(vec![1, 2]).as_bytes(), Some(&[1, 2][..]));
        assert_eq!(
            Value::Pointer(Pointer::new("Player", "p1")).as_pointer(),
            Some(&Pointer::new("Player", "p1"))
        );
    }

    #[test]
    fn object_get() {
        let value = Value::object([("name", Value::from("Alice")), ("age", Value::from(30))]);
        assert_eq!(value.get("name"), Some(&Value::from("Alice")));
        assert_eq!(value.get("missing"), None);
        assert_eq!(Value::Integer(1).get("name"), None);
    }

    #[test]
    fn kind_names() {
        assert_eq!(Value::Null.kind_name(), "null");
        assert_eq!(Value::Relation("Role".into()).kind_name(), "relation");
        assert_eq!(Value::Array(vec![]).kind_name(), "array");
    }
}
