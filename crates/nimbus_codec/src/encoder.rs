//! Wire encoder: `Value` to REST JSON.

use crate::error::{CodecError, CodecResult};
use crate::value::{FileDescriptor, Pointer, Value};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Number, Value as Json};

/// Encode a value into its wire JSON form.
///
/// Structured types are written as `__type` tagged objects:
/// - `Date` → `{"__type": "Date", "iso": "..."}`
/// - `Pointer` → `{"__type": "Pointer", "className", "objectId"}`
/// - `GeoPoint`, `File`, `Bytes`, `Relation` likewise
///
/// # Errors
///
/// Returns [`CodecError::NonFiniteFloat`] for NaN or infinite floats.
pub fn to_wire(value: &Value) -> CodecResult<Json> {
    Ok(match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Integer(n) => Json::Number((*n).into()),
        Value::Float(f) => Json::Number(Number::from_f64(*f).ok_or(CodecError::NonFiniteFloat)?),
        Value::Text(s) => Json::String(s.clone()),
        Value::Bytes(b) => json!({ "__type": "Bytes", "base64": BASE64.encode(b) }),
        Value::Date(d) => encode_date(d),
        Value::Array(items) => Json::Array(items.iter().map(to_wire).collect::<CodecResult<_>>()?),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), to_wire(v)?);
            }
            Json::Object(out)
        }
        Value::Pointer(p) => encode_pointer(p),
        Value::GeoPoint(p) => json!({
            "__type": "GeoPoint",
            "latitude": p.latitude(),
            "longitude": p.longitude(),
        }),
        Value::File(f) => encode_file(f),
        Value::Relation(class_name) => json!({ "__type": "Relation", "className": class_name }),
    })
}

/// Encode a timestamp as a tagged `Date` object.
pub fn encode_date(date: &DateTime<Utc>) -> Json {
    json!({ "__type": "Date", "iso": format_iso(date) })
}

/// Format a timestamp the way the server does: RFC 3339, millisecond
/// precision, `Z` suffix.
pub fn format_iso(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Encode a pointer.
pub fn encode_pointer(pointer: &Pointer) -> Json {
    json!({
        "__type": "Pointer",
        "className": pointer.class_name,
        "objectId": pointer.object_id,
    })
}

fn encode_file(file: &FileDescriptor) -> Json {
    let mut out = Map::new();
    out.insert("__type".into(), Json::String("File".into()));
    out.insert("name".into(), Json::String(file.name.clone()));
    if let Some(ref url) = file.url {
        out.insert("url".into(), Json::String(url.clone()));
    }
    Json::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::GeoPoint;
    use chrono::TimeZone;

    #[test]
    fn encodes_primitives() {
        assert_eq!(to_wire(&Value::Null).unwrap(), Json::Null);
        assert_eq!(to_wire(&Value::Integer(-7)).unwrap(), json!(-7));
        assert_eq!(to_wire(&Value::Float(1.5)).unwrap(), json!(1.5));
        assert_eq!(to_wire(&Value::from("hi")).unwrap(), json!("hi"));
    }

    #[test]
    fn rejects_nan() {
        assert_eq!(
            to_wire(&Value::Float(f64::NAN)),
            Err(CodecError::NonFiniteFloat)
        );
    }

    #[test]
    fn encodes_date_with_millis() {
        let date = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(
            to_wire(&Value::Date(date)).unwrap(),
            json!({ "__type": "Date", "iso": "2024-03-01T12:30:05.000Z" })
        );
    }

    #[test]
    fn encodes_tagged_types() {
        assert_eq!(
            to_wire(&Value::Pointer(Pointer::new("Player", "abc"))).unwrap(),
            json!({ "__type": "Pointer", "className": "Player", "objectId": "abc" })
        );
        assert_eq!(
            to_wire(&Value::GeoPoint(GeoPoint::new(10.0, 20.0).unwrap())).unwrap(),
            json!({ "__type": "GeoPoint", "latitude": 10.0, "longitude": 20.0 })
        );
        assert_eq!(
            to_wire(&Value::Bytes(b"hello".to_vec())).unwrap(),
            json!({ "__type": "Bytes", "base64": "aGVsbG8=" })
        );
        assert_eq!(
            to_wire(&Value::File(FileDescriptor {
                name: "a.txt".into(),
                url: None
            }))
            .unwrap(),
            json!({ "__type": "File", "name": "a.txt" })
        );
    }

    #[test]
    fn encodes_nested_structures() {
        let value = Value::object([(
            "scores",
            Value::Array(vec![Value::Integer(1), Value::Integer(2)]),
        )]);
        assert_eq!(to_wire(&value).unwrap(), json!({ "scores": [1, 2] }));
    }
}
