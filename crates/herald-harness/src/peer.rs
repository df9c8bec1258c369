//! Remote devices for the agent to share keys with.
//!
//! A [`SimPeer`] plays the receiving side of a handshake: it publishes
//! device keys and one-time keys to a [`SimHomeserver`], opens the room keys
//! delivered to it, and decrypts room events with them.

use std::collections::BTreeMap;

use herald_crypto::{CryptoEngine, CryptoError, Curve25519Key, IdentityKeys};
use herald_proto::{
    DeviceId, DeviceKeys, KeyAlgorithm, KeyId, MEGOLM_ALGORITHM, MegolmEncrypted, OLM_ALGORITHM,
    ProtocolError, RoomEventPayload, RoomId, RoomKeyContent, RoomKeyPayload, SignedOneTimeKey,
    Signatures, ToDeviceMessages, UserId, to_canonical_json,
};
use thiserror::Error;

use crate::{
    mock_engine::{MockAccount, MockEngine},
    sim_homeserver::{RoomEvent, SimHomeserver},
};

/// Failures on the receiving side.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Decryption failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// A payload did not have the expected shape.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The message carries no ciphertext for this device.
    #[error("no ciphertext for {0}")]
    NotAddressed(String),

    /// No issued one-time key opens the message.
    #[error("no one-time key of {0} opens the message")]
    UnknownSession(String),
}

/// A remote device with a mock engine account.
pub struct SimPeer {
    user_id: UserId,
    device_id: DeviceId,
    account: MockAccount,
    keys: IdentityKeys,
    issued: Vec<Curve25519Key>,
}

impl SimPeer {
    /// Fresh device `device_id` of `user_id`.
    pub fn new(engine: &MockEngine, user_id: UserId, device_id: DeviceId) -> Self {
        let account = engine.create_account();
        let keys = engine.identity_keys(&account);
        Self { user_id, device_id, account, keys, issued: Vec::new() }
    }

    /// Owner of the device.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Identity keys of the device.
    pub fn keys(&self) -> &IdentityKeys {
        &self.keys
    }

    /// Signed directory entry of the device.
    pub fn device_keys(&self, engine: &MockEngine) -> Result<DeviceKeys, ProtocolError> {
        let mut device_keys = DeviceKeys {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            algorithms: vec![OLM_ALGORITHM.to_string(), MEGOLM_ALGORITHM.to_string()],
            keys: BTreeMap::from([
                (
                    KeyId::for_device(KeyAlgorithm::Curve25519, &self.device_id).to_string(),
                    self.keys.curve25519.to_string(),
                ),
                (
                    KeyId::for_device(KeyAlgorithm::Ed25519, &self.device_id).to_string(),
                    self.keys.ed25519.to_string(),
                ),
            ]),
            signatures: Signatures::new(),
        };

        let signature = engine.sign(&self.account, &to_canonical_json(&device_keys)?);
        device_keys.signatures = self.signatures(signature.as_str());
        Ok(device_keys)
    }

    /// Generate `count` one-time keys and return them signed.
    pub fn issue_one_time_keys(
        &mut self,
        engine: &MockEngine,
        count: usize,
    ) -> Result<Vec<(KeyId, SignedOneTimeKey)>, ProtocolError> {
        engine.generate_one_time_keys(&mut self.account, count);

        let mut issued = Vec::with_capacity(count);
        for one_time_key in engine.one_time_keys(&self.account) {
            let mut signed =
                SignedOneTimeKey { key: one_time_key.key.to_string(), signatures: Signatures::new() };
            let signature = engine.sign(&self.account, &to_canonical_json(&signed)?);
            signed.signatures = self.signatures(signature.as_str());

            self.issued.push(one_time_key.key);
            issued.push((KeyId::new(KeyAlgorithm::SignedCurve25519, one_time_key.id), signed));
        }
        engine.mark_keys_as_published(&mut self.account);

        Ok(issued)
    }

    /// Publish the device with `one_time_keys` claimable keys and join
    /// `room_id`.
    pub fn enroll(
        &mut self,
        engine: &MockEngine,
        server: &SimHomeserver,
        room_id: &RoomId,
        one_time_keys: usize,
    ) -> Result<(), ProtocolError> {
        server.add_device(self.device_keys(engine)?);
        for (key_id, key) in self.issue_one_time_keys(engine, one_time_keys)? {
            server.add_one_time_key(&self.user_id, &self.device_id, key_id, key);
        }
        server.add_member(room_id, self.user_id.clone());
        Ok(())
    }

    /// Open the room key addressed to this device in a to-device batch.
    ///
    /// Returns `None` when the batch has no entry for this device.
    pub fn open_room_key(
        &self,
        messages: &ToDeviceMessages,
    ) -> Result<Option<RoomKeyPayload>, PeerError> {
        let Some(envelope) = messages.get(&self.user_id, &self.device_id) else {
            return Ok(None);
        };

        let ciphertext = envelope
            .ciphertext
            .get(self.keys.curve25519.as_str())
            .ok_or_else(|| PeerError::NotAddressed(self.device_id.to_string()))?;
        let sender_key = Curve25519Key::from(envelope.sender_key.as_str());

        // The claimed key is not named in the message; try each one issued.
        let plaintext = self
            .issued
            .iter()
            .find_map(|one_time_key| {
                MockEngine::decrypt_pairwise(
                    &sender_key,
                    &self.keys.curve25519,
                    one_time_key,
                    &ciphertext.body,
                )
                .ok()
            })
            .ok_or_else(|| PeerError::UnknownSession(self.device_id.to_string()))?;

        let payload = serde_json::from_str(&plaintext).map_err(ProtocolError::from)?;
        Ok(Some(payload))
    }

    /// Decrypt a group-encrypted room event with a delivered room key.
    pub fn decrypt_room_event(
        room_key: &RoomKeyContent,
        event: &RoomEvent,
    ) -> Result<RoomEventPayload<serde_json::Value>, PeerError> {
        let envelope: MegolmEncrypted =
            serde_json::from_value(event.content.clone()).map_err(ProtocolError::from)?;
        let plaintext = MockEngine::decrypt_group(&room_key.session_key, &envelope.ciphertext)?;
        let payload = serde_json::from_str(&plaintext).map_err(ProtocolError::from)?;

        Ok(payload)
    }

    fn signatures(&self, signature: &str) -> Signatures {
        let key_id = KeyId::for_device(KeyAlgorithm::Ed25519, &self.device_id).to_string();
        Signatures::from([(
            self.user_id.clone(),
            BTreeMap::from([(key_id, signature.to_string())]),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_keys_are_signed_by_the_device() {
        let engine = MockEngine::new(3);
        let peer = SimPeer::new(&engine, UserId::new("@bob:sim"), DeviceId::new("PHONE"));

        let mut device_keys = peer.device_keys(&engine).unwrap();
        let signature = device_keys.signatures[peer.user_id()]["ed25519:PHONE"].clone();
        device_keys.signatures = Signatures::new();

        assert!(MockEngine::verify(
            &peer.keys().ed25519,
            &to_canonical_json(&device_keys).unwrap(),
            &signature.as_str().into(),
        ));
    }

    #[test]
    fn issued_keys_are_not_issued_twice() {
        let engine = MockEngine::new(3);
        let mut peer = SimPeer::new(&engine, UserId::new("@bob:sim"), DeviceId::new("PHONE"));

        let first = peer.issue_one_time_keys(&engine, 2).unwrap();
        let second = peer.issue_one_time_keys(&engine, 2).unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert!(first.iter().all(|(id, _)| second.iter().all(|(other, _)| other != id)));
    }
}
