//! Cryptographic engine errors.

use thiserror::Error;

/// Errors raised by a [`CryptoEngine`](crate::CryptoEngine).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// A public key could not be decoded.
    #[error("invalid {kind} key: {reason}")]
    InvalidKey {
        /// Which key was being decoded
        kind: &'static str,
        /// Decoder message
        reason: String,
    },

    /// Encryption failed.
    #[error("encryption failed: {reason}")]
    EncryptionFailed {
        /// Engine message
        reason: String,
    },

    /// Account state could not be pickled or restored.
    #[error("pickle error: {reason}")]
    Pickle {
        /// Engine message
        reason: String,
    },
}
