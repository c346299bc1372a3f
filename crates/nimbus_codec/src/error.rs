//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding wire values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    /// The JSON has a shape the codec does not understand.
    #[error("invalid wire structure: {message}")]
    InvalidStructure {
        /// Description of the structural error.
        message: String,
    },

    /// A `__type` tag the codec does not know.
    #[error("unknown wire type: {type_name}")]
    UnknownType {
        /// The unrecognized tag.
        type_name: String,
    },

    /// NaN and infinities have no JSON representation.
    #[error("non-finite float values cannot be encoded")]
    NonFiniteFloat,

    /// A date string that is not RFC 3339.
    #[error("invalid date: {value}")]
    InvalidDate {
        /// The offending string.
        value: String,
    },

    /// Base64 payload failed to decode.
    #[error("invalid base64 payload: {message}")]
    InvalidBase64 {
        /// Decoder message.
        message: String,
    },

    /// Latitude or longitude outside the valid range.
    #[error("invalid geo point: latitude {latitude}, longitude {longitude}")]
    InvalidGeoPoint {
        /// Latitude in degrees.
        latitude: f64,
        /// Longitude in degrees.
        longitude: f64,
    },
}

impl CodecError {
    /// Create an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure {
            message: message.into(),
        }
    }

    /// Create an unknown type error.
    pub fn unknown_type(type_name: impl Into<String>) -> Self {
        Self::UnknownType {
            type_name: type_name.into(),
        }
    }
}
