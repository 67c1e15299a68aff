//! Model database configuration.
//!
//! Settings are plain serde structs so they can be embedded in whatever
//! configuration file the application already loads. Every field has a
//! default, so an empty JSON object is a valid configuration.

use serde::{Deserialize, Serialize};

use crate::error::DmError;

/// Default size, in bytes, of the shared JSON buffer.
pub const DEFAULT_JSON_CAPACITY: usize = 2 * 1024;

/// Settings for a [`ModelDatabase`](crate::ModelDatabase).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DatabaseConfig {
    /// Largest JSON document accepted by `from_json` or produced by `to_json`.
    ///
    /// The shared JSON buffer is process wide; the limit is applied per call.
    pub json_capacity: usize,

    /// Reason code used by `set_invalid()` and by read-modify-write
    /// callbacks that return `Invalidate`.
    pub default_invalid_reason: u8,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            json_capacity: DEFAULT_JSON_CAPACITY,
            default_invalid_reason: 1,
        }
    }
}

impl DatabaseConfig {
    /// Parse a configuration from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, DmError> {
        serde_json::from_str(text).map_err(|e| DmError::Config(e.to_string()))
    }
}
