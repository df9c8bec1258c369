//! Event payloads.
//!
//! The closed set of event bodies Herald sends:
//!
//! - [`RoomMessageContent`]: `m.room.message` content, sent as-is or wrapped
//!   in a [`RoomEventPayload`] before group encryption
//! - [`MegolmEncrypted`]: `m.room.encrypted` room event carrying a group
//!   session ciphertext
//! - [`RoomKeyContent`] inside a [`RoomKeyPayload`]: the `m.room_key`
//!   plaintext handed to a device over its pairwise session
//! - [`OlmEncrypted`]: `m.room.encrypted` to-device event carrying pairwise
//!   ciphertext, batched per recipient in [`ToDeviceMessages`]

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::{
    HTML_FORMAT, MEGOLM_ALGORITHM, OLM_ALGORITHM, TEXT_MSGTYPE,
    ids::{DeviceId, RoomId, UserId},
};

/// Event types Herald sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// `m.room.message`
    RoomMessage,
    /// `m.room.encrypted`
    RoomEncrypted,
    /// `m.room_key`
    RoomKey,
}

impl EventType {
    /// Wire name of the event type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoomMessage => "m.room.message",
            Self::RoomEncrypted => "m.room.encrypted",
            Self::RoomKey => "m.room_key",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content of an `m.room.message` text event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMessageContent {
    /// Always `m.text` for messages Herald builds
    pub msgtype: String,
    /// Plain-text body
    pub body: String,
    /// HTML body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
    /// Format of `formatted_body`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl RoomMessageContent {
    /// Plain text message.
    pub fn text(body: impl Into<String>) -> Self {
        Self { msgtype: TEXT_MSGTYPE.to_string(), body: body.into(), formatted_body: None, format: None }
    }

    /// HTML message with a plain-text fallback body.
    pub fn html(body: impl Into<String>, formatted_body: impl Into<String>) -> Self {
        Self {
            msgtype: TEXT_MSGTYPE.to_string(),
            body: body.into(),
            formatted_body: Some(formatted_body.into()),
            format: Some(HTML_FORMAT.to_string()),
        }
    }
}

/// Plaintext of a group-encrypted room event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomEventPayload<C> {
    /// Event type of the wrapped event
    #[serde(rename = "type")]
    pub event_type: String,
    /// Wrapped event content
    pub content: C,
    /// Room the event belongs to
    pub room_id: RoomId,
}

/// Group-encrypted room event (`m.room.encrypted`, Megolm).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MegolmEncrypted {
    /// Always [`MEGOLM_ALGORITHM`]
    pub algorithm: String,
    /// Sender's curve25519 identity key
    pub sender_key: String,
    /// Sending device
    pub device_id: DeviceId,
    /// Group session the ciphertext belongs to
    pub session_id: String,
    /// Group session ciphertext
    pub ciphertext: String,
}

impl MegolmEncrypted {
    /// Build the envelope for a group session ciphertext.
    pub fn new(
        sender_key: impl Into<String>,
        device_id: DeviceId,
        session_id: impl Into<String>,
        ciphertext: impl Into<String>,
    ) -> Self {
        Self {
            algorithm: MEGOLM_ALGORITHM.to_string(),
            sender_key: sender_key.into(),
            device_id,
            session_id: session_id.into(),
            ciphertext: ciphertext.into(),
        }
    }
}

/// Content of an `m.room_key` event: the group session being shared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyContent {
    /// Always [`MEGOLM_ALGORITHM`]
    pub algorithm: String,
    /// Room the group session encrypts
    pub room_id: RoomId,
    /// Group session id
    pub session_id: String,
    /// Exported group session key
    pub session_key: String,
}

impl RoomKeyContent {
    /// Share `session_id`/`session_key` for `room_id`.
    pub fn new(room_id: RoomId, session_id: impl Into<String>, session_key: impl Into<String>) -> Self {
        Self {
            algorithm: MEGOLM_ALGORITHM.to_string(),
            room_id,
            session_id: session_id.into(),
            session_key: session_key.into(),
        }
    }
}

/// Ed25519 key binding used in pairwise payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ed25519Binding {
    /// Ed25519 public key
    pub ed25519: String,
}

/// Pairwise plaintext delivering a room key to one device.
///
/// Binds sender and recipient identities so the recipient can reject a key
/// replayed from another conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomKeyPayload {
    /// The shared group session
    pub content: RoomKeyContent,
    /// Always `m.room_key`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Sending user
    pub sender: UserId,
    /// Receiving user
    pub recipient: UserId,
    /// Sender's ed25519 key
    pub keys: Ed25519Binding,
    /// Recipient device's ed25519 key
    pub recipient_keys: Ed25519Binding,
}

impl RoomKeyPayload {
    /// Address `content` from `sender` to `recipient`.
    pub fn new(
        content: RoomKeyContent,
        sender: UserId,
        sender_ed25519: impl Into<String>,
        recipient: UserId,
        recipient_ed25519: impl Into<String>,
    ) -> Self {
        Self {
            content,
            event_type: EventType::RoomKey.as_str().to_string(),
            sender,
            recipient,
            keys: Ed25519Binding { ed25519: sender_ed25519.into() },
            recipient_keys: Ed25519Binding { ed25519: recipient_ed25519.into() },
        }
    }
}

/// Pairwise ciphertext addressed to one curve25519 key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmCiphertextBody {
    /// Ciphertext (base64)
    pub body: String,
    /// Olm message type: 0 for pre-key messages, 1 for normal messages
    #[serde(rename = "type")]
    pub message_type: u8,
}

/// Pairwise-encrypted to-device event (`m.room.encrypted`, Olm).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OlmEncrypted {
    /// Always [`OLM_ALGORITHM`]
    pub algorithm: String,
    /// Sender's curve25519 identity key
    pub sender_key: String,
    /// Unused for Olm; omitted when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Unused for Olm; omitted when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    /// Ciphertexts keyed by recipient curve25519 key
    pub ciphertext: BTreeMap<String, OlmCiphertextBody>,
}

impl OlmEncrypted {
    /// Envelope carrying one ciphertext for `recipient_key`.
    pub fn new(
        sender_key: impl Into<String>,
        recipient_key: impl Into<String>,
        body: OlmCiphertextBody,
    ) -> Self {
        Self {
            algorithm: OLM_ALGORITHM.to_string(),
            sender_key: sender_key.into(),
            session_id: None,
            device_id: None,
            ciphertext: BTreeMap::from([(recipient_key.into(), body)]),
        }
    }
}

/// A to-device batch: `user → device → event content`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToDeviceMessages<C = OlmEncrypted> {
    /// Per-recipient contents
    pub messages: BTreeMap<UserId, BTreeMap<DeviceId, C>>,
}

impl<C> Default for ToDeviceMessages<C> {
    fn default() -> Self {
        Self { messages: BTreeMap::new() }
    }
}

impl<C> ToDeviceMessages<C> {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the content for one device.
    pub fn insert(&mut self, user_id: UserId, device_id: DeviceId, content: C) {
        self.messages.entry(user_id).or_default().insert(device_id, content);
    }

    /// Content addressed to one device.
    pub fn get(&self, user_id: &UserId, device_id: &DeviceId) -> Option<&C> {
        self.messages.get(user_id).and_then(|devices| devices.get(device_id))
    }

    /// Total number of addressed devices.
    pub fn device_count(&self) -> usize {
        self.messages.values().map(BTreeMap::len).sum()
    }

    /// Check if no device is addressed.
    pub fn is_empty(&self) -> bool {
        self.device_count() == 0
    }

    /// Iterate over `(user, device, content)`.
    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &DeviceId, &C)> {
        self.messages
            .iter()
            .flat_map(|(user, devices)| devices.iter().map(move |(device, c)| (user, device, c)))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn html_message_shape() {
        let content = RoomMessageContent::html("hi there", "<b>hi</b> there");

        assert_eq!(
            serde_json::to_value(&content).unwrap(),
            json!({
                "msgtype": "m.text",
                "body": "hi there",
                "formatted_body": "<b>hi</b> there",
                "format": "org.matrix.custom.html",
            })
        );
    }

    #[test]
    fn plain_message_omits_format() {
        let value = serde_json::to_value(RoomMessageContent::text("hi")).unwrap();
        assert_eq!(value, json!({ "msgtype": "m.text", "body": "hi" }));
    }

    #[test]
    fn megolm_envelope_shape() {
        let envelope = MegolmEncrypted::new("curve-me", DeviceId::new("MYDEV"), "sess", "ct");

        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({
                "algorithm": "m.megolm.v1.aes-sha2",
                "sender_key": "curve-me",
                "device_id": "MYDEV",
                "session_id": "sess",
                "ciphertext": "ct",
            })
        );
    }

    #[test]
    fn room_key_payload_shape() {
        let content = RoomKeyContent::new(RoomId::new("!abc:x"), "sess", "skey");
        let payload = RoomKeyPayload::new(
            content,
            UserId::new("@me:x"),
            "ed-me",
            UserId::new("@bob:x"),
            "ed-bob",
        );

        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({
                "content": {
                    "algorithm": "m.megolm.v1.aes-sha2",
                    "room_id": "!abc:x",
                    "session_id": "sess",
                    "session_key": "skey",
                },
                "type": "m.room_key",
                "sender": "@me:x",
                "recipient": "@bob:x",
                "keys": { "ed25519": "ed-me" },
                "recipient_keys": { "ed25519": "ed-bob" },
            })
        );
    }

    #[test]
    fn olm_envelope_keys_ciphertext_by_recipient_curve_key() {
        let envelope = OlmEncrypted::new(
            "curve-me",
            "curve-bob",
            OlmCiphertextBody { body: "ct".to_string(), message_type: 0 },
        );

        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({
                "algorithm": "m.olm.v1.curve25519-aes-sha2",
                "sender_key": "curve-me",
                "ciphertext": { "curve-bob": { "body": "ct", "type": 0 } },
            })
        );
    }

    #[test]
    fn to_device_batch_groups_by_user_then_device() {
        let mut batch = ToDeviceMessages::new();
        batch.insert(UserId::new("@a:x"), DeviceId::new("A1"), 1);
        batch.insert(UserId::new("@a:x"), DeviceId::new("A2"), 2);
        batch.insert(UserId::new("@b:x"), DeviceId::new("B1"), 3);

        assert_eq!(batch.device_count(), 3);
        assert_eq!(batch.get(&UserId::new("@a:x"), &DeviceId::new("A2")), Some(&2));
        assert_eq!(
            serde_json::to_value(&batch).unwrap(),
            json!({ "messages": { "@a:x": { "A1": 1, "A2": 2 }, "@b:x": { "B1": 3 } } })
        );
    }
}
