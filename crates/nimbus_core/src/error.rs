//! Error types for the object model.
//!
//! Every error here is raised locally and synchronously; none of them
//! ever reaches the transport.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in local object-model operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// A value, key or constraint failed validation.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the failure.
        message: String,
    },

    /// The key is managed by the server or by a dedicated setter.
    #[error("reserved key: {key}")]
    ReservedKey {
        /// The rejected key.
        key: String,
    },

    /// The field already has a value and cannot be reassigned.
    #[error("immutable field: {field}")]
    ImmutableField {
        /// The field that was reassigned.
        field: String,
    },

    /// An operation cannot be combined with what is already pending.
    #[error("cannot apply {incoming} to key {key} after {pending}")]
    IncompatibleOperation {
        /// Attribute key.
        key: String,
        /// Description of the pending operation or current value.
        pending: String,
        /// Name of the rejected operation.
        incoming: String,
    },

    /// The entity was destroyed and accepts no further mutation.
    #[error("entity of class {class_name} has been destroyed")]
    Destroyed {
        /// Class of the destroyed entity.
        class_name: String,
    },

    /// A value could not be converted to or from its wire form.
    #[error("codec error: {0}")]
    Codec(#[from] nimbus_codec::CodecError),
}

impl CoreError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a reserved key error.
    pub fn reserved_key(key: impl Into<String>) -> Self {
        Self::ReservedKey { key: key.into() }
    }

    /// Creates an incompatible operation error.
    pub fn incompatible(
        key: impl Into<String>,
        pending: impl Into<String>,
        incoming: impl Into<String>,
    ) -> Self {
        Self::IncompatibleOperation {
            key: key.into(),
            pending: pending.into(),
            incoming: incoming.into(),
        }
    }

    /// Returns true for errors that reject input before anything is
    /// recorded (bad keys, bad values, reassigned identity).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CoreError::Validation { .. }
                | CoreError::ReservedKey { .. }
                | CoreError::ImmutableField { .. }
                | CoreError::Codec(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CoreError::incompatible("score", "Set(text)", "Increment");
        assert_eq!(
            err.to_string(),
            "cannot apply Increment to key score after Set(text)"
        );
        assert_eq!(
            CoreError::reserved_key("objectId").to_string(),
            "reserved key: objectId"
        );
    }

    #[test]
    fn validation_classification() {
        assert!(CoreError::validation("bad").is_validation());
        assert!(CoreError::reserved_key("createdAt").is_validation());
        assert!(!CoreError::incompatible("k", "a", "b").is_validation());
        assert!(!CoreError::Destroyed {
            class_name: "Game".into()
        }
        .is_validation());
    }
}
