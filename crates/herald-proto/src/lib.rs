//! Herald wire payloads.
//!
//! Typed representations of everything Herald puts on the wire or reads back
//! from the homeserver's key directory. Event bodies are a closed set of
//! structs with explicit fields instead of ad hoc JSON maps, so a missing
//! field or a misspelled key is a compile error rather than an interop bug.
//!
//! # Layout
//!
//! - [`ids`]: Room, user and device identifiers
//! - [`keys`]: Key ids (`<algorithm>:<id>`) and directory shapes returned by
//!   key query and key claim
//! - [`events`]: Room events, room-key events and the encrypted envelopes
//! - [`canonical`]: Canonical JSON used for signing
//!
//! # Invariants
//!
//! - Every event struct serializes to exactly the field names the Matrix
//!   client-server API expects. Algorithm and event type strings come from the
//!   constants in this crate, never from string literals at call sites.

#![forbid(unsafe_code)]

pub mod canonical;
pub mod errors;
pub mod events;
pub mod ids;
pub mod keys;

pub use canonical::to_canonical_json;
pub use errors::{ProtocolError, Result};
pub use events::{
    EventType, MegolmEncrypted, OlmCiphertextBody, OlmEncrypted, RoomEventPayload, RoomKeyContent,
    RoomKeyPayload, RoomMessageContent, ToDeviceMessages,
};
pub use ids::{DeviceId, RoomId, UserId};
pub use keys::{
    ClaimResponse, ClaimedKey, DeviceKeys, DeviceKeysResponse, KeyAlgorithm, KeyId,
    OneTimeKeyClaim, SignedOneTimeKey, Signatures,
};

/// Olm pairwise encryption algorithm identifier.
pub const OLM_ALGORITHM: &str = "m.olm.v1.curve25519-aes-sha2";

/// Megolm group encryption algorithm identifier.
pub const MEGOLM_ALGORITHM: &str = "m.megolm.v1.aes-sha2";

/// Format tag for HTML-formatted message bodies.
pub const HTML_FORMAT: &str = "org.matrix.custom.html";

/// Plain text message type.
pub const TEXT_MSGTYPE: &str = "m.text";
