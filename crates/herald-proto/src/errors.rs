//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while building or interpreting wire payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Key id was not of the form `<algorithm>:<id>`.
    #[error("malformed key id: {0:?}")]
    MalformedKeyId(String),

    /// A device's published keys lack an expected entry.
    #[error("device {device_id} of {user_id} has no {key_id} key")]
    MissingDeviceKey {
        /// Owner of the device
        user_id: String,
        /// Device whose keys were inspected
        device_id: String,
        /// Key id that was looked up
        key_id: String,
    },

    /// JSON encoding failed.
    #[error("json encoding failed: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encode(err.to_string())
    }
}
