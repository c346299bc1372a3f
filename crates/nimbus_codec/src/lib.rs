//! # Nimbus Codec
//!
//! Attribute values and their JSON wire encoding.
//!
//! This crate provides:
//! - [`Value`], the dynamic value an entity attribute can hold
//! - [`GeoPoint`] with great-circle distances
//! - [`to_wire`] / [`from_wire`] for the REST JSON representation
//!
//! ## Wire rules
//!
//! - Primitives map to JSON primitives
//! - Structured values are `__type` tagged objects
//! - Dates are RFC 3339 with millisecond precision and a `Z` suffix
//! - Object keys are emitted in sorted order
//!
//! ## Usage
//!
//! ```
//! use nimbus_codec::{from_wire, to_wire, Pointer, Value};
//!
//! let value = Value::Pointer(Pointer::new("Player", "x1"));
//! let json = to_wire(&value).unwrap();
//! assert_eq!(json["__type"], "Pointer");
//! assert_eq!(from_wire(&json).unwrap(), value);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod geo;
mod value;

pub use decoder::{decode_date, decode_map, from_wire, parse_iso};
pub use encoder::{encode_date, encode_pointer, format_iso, to_wire};
pub use error::{CodecError, CodecResult};
pub use geo::{GeoPoint, EARTH_RADIUS_KM, EARTH_RADIUS_MILES};
pub use value::{FileDescriptor, Pointer, Value};

/// Re-exported so downstream crates name the same JSON type.
pub use serde_json::Value as Json;
