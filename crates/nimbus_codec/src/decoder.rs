//! Wire decoder: REST JSON to `Value`.

use crate::error::{CodecError, CodecResult};
use crate::geo::GeoPoint;
use crate::value::{FileDescriptor, Pointer, Value};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;

/// Decode a wire JSON value.
///
/// Tagged objects (`__type`) decode into their structured variants.
/// A full nested record (`__type: "Object"`) decodes into an
/// [`Value::Object`] that keeps its `className` and `objectId` keys so
/// callers can materialize it.
///
/// # Errors
///
/// Returns an error for unknown tags or malformed tagged objects.
pub fn from_wire(json: &Json) -> CodecResult<Value> {
    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Float(
                n.as_f64()
                    .ok_or_else(|| CodecError::invalid_structure("unrepresentable number"))?,
            ),
        },
        Json::String(s) => Value::Text(s.clone()),
        Json::Array(items) => Value::Array(items.iter().map(from_wire).collect::<CodecResult<_>>()?),
        Json::Object(map) => match map.get("__type").and_then(Json::as_str) {
            Some(tag) => decode_tagged(tag, map)?,
            None => Value::Object(decode_map(map)?),
        },
    })
}

/// Decode every entry of a JSON object.
pub fn decode_map(map: &Map<String, Json>) -> CodecResult<BTreeMap<String, Value>> {
    map.iter()
        .map(|(k, v)| Ok((k.clone(), from_wire(v)?)))
        .collect()
}

/// Parse an RFC 3339 timestamp.
pub fn parse_iso(value: &str) -> CodecResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|_| CodecError::InvalidDate {
            value: value.to_string(),
        })
}

/// Decode a date that is either a plain RFC 3339 string or a tagged
/// `Date` object.
pub fn decode_date(json: &Json) -> CodecResult<DateTime<Utc>> {
    match json {
        Json::String(s) => parse_iso(s),
        Json::Object(map) => parse_iso(text_field(map, "iso")?),
        _ => Err(CodecError::invalid_structure("expected date")),
    }
}

fn decode_tagged(tag: &str, map: &Map<String, Json>) -> CodecResult<Value> {
    match tag {
        "Date" => Ok(Value::Date(parse_iso(text_field(map, "iso")?)?)),
        "Pointer" => Ok(Value::Pointer(Pointer::new(
            text_field(map, "className")?,
            text_field(map, "objectId")?,
        ))),
        "GeoPoint" => {
            let latitude = number_field(map, "latitude")?;
            let longitude = number_field(map, "longitude")?;
            Ok(Value::GeoPoint(GeoPoint::new(latitude, longitude)?))
        }
        "File" => Ok(Value::File(FileDescriptor {
            name: text_field(map, "name")?.to_string(),
            url: map.get("url").and_then(Json::as_str).map(str::to_string),
        })),
        "Bytes" => {
            let bytes = BASE64
                .decode(text_field(map, "base64")?)
                .map_err(|e| CodecError::InvalidBase64 {
                    message: e.to_string(),
                })?;
            Ok(Value::Bytes(bytes))
        }
        "Relation" => Ok(Value::Relation(text_field(map, "className")?.to_string())),
        "Object" => {
            let mut fields = map.clone();
            fields.remove("__type");
            Ok(Value::Object(decode_map(&fields)?))
        }
        other => Err(CodecError::unknown_type(other)),
    }
}

fn text_field<'a>(map: &'a Map<String, Json>, name: &str) -> CodecResult<&'a str> {
    map.get(name)
        .and_then(Json::as_str)
        .ok_or_else(|| CodecError::invalid_structure(format!("missing {name}")))
}

fn number_field(map: &Map<String, Json>, name: &str) -> CodecResult<f64> {
    map.get(name)
        .and_then(Json::as_f64)
        .ok_or_else(|| CodecError::invalid_structure(format!("missing {name}")))
}
