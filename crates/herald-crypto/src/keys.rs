//! Public key and ciphertext values exchanged with the engine.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! base64_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an unpadded base64 key.
            pub fn new(base64: impl Into<String>) -> Self {
                Self(base64.into())
            }

            /// Unpadded base64 encoding.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(key: &str) -> Self {
                Self(key.to_string())
            }
        }
    };
}

base64_key!(
    /// Curve25519 public key (identity key or one-time key).
    Curve25519Key
);

base64_key!(
    /// Ed25519 public signing key.
    Ed25519Key
);

base64_key!(
    /// Ed25519 signature.
    Signature
);

/// Long-term public keys of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityKeys {
    /// Curve25519 identity key, used as the pairwise `sender_key`
    pub curve25519: Curve25519Key,
    /// Ed25519 fingerprint key, used for signatures
    pub ed25519: Ed25519Key,
}

/// An unpublished one-time key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneTimeKey {
    /// Engine-assigned key id (the part after `signed_curve25519:`)
    pub id: String,
    /// Public key
    pub key: Curve25519Key,
}

/// Output of a pairwise encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OlmCiphertext {
    /// 0 for a pre-key message, 1 for a normal message
    pub message_type: u8,
    /// Base64 ciphertext
    pub body: String,
}

impl OlmCiphertext {
    /// Message type of the first message on a fresh outbound session.
    pub const PRE_KEY: u8 = 0;

    /// Message type once the peer has replied.
    pub const NORMAL: u8 = 1;
}
