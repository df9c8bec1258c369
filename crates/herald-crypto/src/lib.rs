//! Herald Cryptographic Engine
//!
//! The narrow interface through which the session orchestration layer uses
//! cryptographic primitives. Nothing in Herald's core depends on a specific
//! ratchet implementation: accounts, pairwise sessions and group sessions are
//! opaque associated types of [`CryptoEngine`], and keys cross the boundary as
//! unpadded base64 strings.
//!
//! # Key Lifecycle
//!
//! ```text
//! Account (curve25519 + ed25519 identity, one-time key pool)
//!        │
//!        ├── sign()                     → device key / one-time key signatures
//!        │
//!        ├── create_outbound_session()  → PairwiseSession (one per peer device)
//!        │        │
//!        │        ▼
//!        │   encrypt_pairwise()         → room key delivery (pre-key message)
//!        │
//! create_group_session()                → GroupSession (one per room)
//!        │
//!        ▼
//! encrypt_group()                       → room event ciphertext
//! ```
//!
//! # Security
//!
//! One-time keys are single use:
//! - `one_time_keys()` lists only keys not yet marked published
//! - After `mark_keys_as_published()` the engine never lists those keys again
//!
//! # Engines
//!
//! - With the `olm` feature, [`OlmEngine`] binds the interface to vodozemac.
//! - Tests use a deterministic engine from the harness crate.

#![forbid(unsafe_code)]

mod engine;
mod error;
mod keys;
#[cfg(feature = "olm")]
mod olm;

pub use engine::CryptoEngine;
pub use error::CryptoError;
pub use keys::{Curve25519Key, Ed25519Key, IdentityKeys, OlmCiphertext, OneTimeKey, Signature};
#[cfg(feature = "olm")]
pub use olm::{OlmEngine, PICKLE_KEY_SIZE};
