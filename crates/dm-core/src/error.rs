//! Error type for model database operations.
//!
//! Conditions that are part of normal operation (writing to a locked point,
//! an identical write) are not errors and never show up here.

use thiserror::Error;

/// Errors that can occur while registering, parsing or transferring model points.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DmError {
    /// A point with this name is already registered in the database.
    #[error("Model Point name ({0}) is already registered")]
    DuplicateName(String),

    /// Point names must be non-empty.
    #[error("Model Point name must not be empty")]
    EmptyName,

    /// No point with this name exists in the database.
    #[error("Model Point name ({0}) NOT found.")]
    NotFound(String),

    /// The handle refers to a point that has been removed from its database.
    #[error("Model Point ({0}) is no longer registered")]
    StaleHandle(String),

    /// The JSON text could not be parsed.
    #[error("Malformed JSON: {0}")]
    MalformedJson(String),

    /// The JSON text is larger than the shared JSON buffer.
    #[error("JSON document is {size} bytes, exceeds the {capacity} byte buffer")]
    JsonTooLarge { size: usize, capacity: usize },

    /// The JSON request has no usable `name` key.
    #[error("No valid 'name' key in the JSON input.")]
    MissingName,

    /// An envelope key has the wrong JSON type or an out-of-range value.
    #[error("Invalid '{key}' key/value pair: {reason}")]
    InvalidKey { key: &'static str, reason: String },

    /// The JSON request names a point but asks for nothing.
    #[error("JSON request for ({0}) has no 'val', 'valid', 'invalid' or 'locked' key")]
    NoAction(String),

    /// The `val` payload could not be converted to the point's type.
    #[error("Invalid syntax for the 'val' key/value pair of ({name}): {reason}")]
    BadPayload { name: String, reason: String },

    /// A typed handle was requested for a point of another type.
    #[error("Model Point ({name}) is of type {actual}, not {expected}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// Export/import buffer cannot hold the point's external representation.
    #[error("Buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Configuration text could not be parsed.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_are_descriptive() {
        assert_eq!(
            DmError::NotFound("APPLE".into()).to_string(),
            "Model Point name (APPLE) NOT found."
        );
        let err = DmError::BufferTooSmall {
            needed: 6,
            available: 2,
        };
        assert!(err.to_string().contains("need 6"));
    }
}
