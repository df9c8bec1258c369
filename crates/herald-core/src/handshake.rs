//! Pairwise session manager: distributing a group session key.
//!
//! A handshake brings every member device of a room up to date with the
//! room's current group session. Devices already in the session's
//! [`ShakenSet`] are left alone; every other device gets the key over a fresh
//! pairwise session seeded with one of its one-time keys.
//!
//! # Stages
//!
//! ```text
//! Idle ─► MembersResolved ─► KeysQueried ─► KeysClaimed ─► SessionsEstablished ─► KeysDelivered
//! ```
//!
//! A failure at any stage aborts the handshake. A device that returned no
//! one-time key is skipped, not fatal.
//!
//! # Invariants
//!
//! - Claims never include a device already in the [`ShakenSet`]
//! - The agent's own device is never a target
//! - A device is added to the [`ShakenSet`] only after the to-device batch
//!   carrying its key was accepted by the transport
//! - Each pairwise session carries exactly one key delivery and is dropped

use std::{fmt, sync::Arc};

use herald_crypto::{CryptoEngine, Curve25519Key};
use herald_proto::{
    ClaimResponse, DeviceId, EventType, KeyAlgorithm, OlmCiphertextBody, OlmEncrypted,
    OneTimeKeyClaim, RoomId, RoomKeyContent, RoomKeyPayload, ToDeviceMessages, UserId,
    to_canonical_json,
};

use crate::{
    directory::{Device, DeviceDirectory},
    env::Environment,
    error::{Operation, SessionError},
    identity::Identity,
    room::{OutboundGroup, ShakenSet},
    transport::{Credentials, Transport},
};

/// Progress of one handshake, for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    /// Nothing done yet
    Idle,
    /// Room members listed
    MembersResolved,
    /// Member device keys fetched
    KeysQueried,
    /// One-time keys claimed for devices lacking the key
    KeysClaimed,
    /// Pairwise sessions created
    SessionsEstablished,
    /// Key delivery batch accepted
    KeysDelivered,
}

impl HandshakeStage {
    /// Snake-case name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::MembersResolved => "members_resolved",
            Self::KeysQueried => "keys_queried",
            Self::KeysClaimed => "keys_claimed",
            Self::SessionsEstablished => "sessions_established",
            Self::KeysDelivered => "keys_delivered",
        }
    }
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fresh outbound pairwise session to one device.
pub struct PairwiseSession<C: CryptoEngine> {
    /// The peer device
    pub device: Device,
    session: C::PairwiseSession,
}

/// Result of a key delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDelivery {
    /// Transaction id of the to-device batch
    pub txn_id: String,
    /// Devices the batch addressed
    pub recipients: Vec<(UserId, DeviceId)>,
}

/// What a handshake did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReport {
    /// Last stage reached
    pub stage: HandshakeStage,
    /// Member devices with both identity keys
    pub devices: usize,
    /// Devices a one-time key was requested for
    pub claimed: usize,
    /// Devices that received the key in this handshake
    pub delivered: Vec<(UserId, DeviceId)>,
}

/// Devices that still need the key, and the claim request covering them.
///
/// Skips the agent's own device and every device in `shaken`.
pub fn pending_devices(
    devices: Vec<Device>,
    own: &Credentials,
    shaken: &ShakenSet,
) -> (Vec<Device>, OneTimeKeyClaim) {
    let mut claim = OneTimeKeyClaim::new();
    let pending: Vec<Device> = devices
        .into_iter()
        .filter(|d| !(d.user_id == own.user_id && d.device_id == own.device_id))
        .filter(|d| !shaken.contains(&d.user_id, &d.device_id))
        .collect();

    for device in &pending {
        claim
            .entry(device.user_id.clone())
            .or_default()
            .insert(device.device_id.clone(), KeyAlgorithm::SignedCurve25519);
    }

    (pending, claim)
}

/// Creates pairwise sessions and delivers group session keys over them.
pub struct PairwiseSessionManager<C: CryptoEngine, T: Transport, E: Environment> {
    engine: Arc<C>,
    transport: Arc<T>,
    directory: DeviceDirectory<T>,
    env: E,
}

impl<C: CryptoEngine, T: Transport, E: Environment> PairwiseSessionManager<C, T, E> {
    /// Manager over the given engine and transport.
    pub fn new(engine: Arc<C>, transport: Arc<T>, env: E) -> Self {
        let directory = DeviceDirectory::new(Arc::clone(&transport));
        Self { engine, transport, directory, env }
    }

    /// The directory used for membership and key lookups.
    pub fn directory(&self) -> &DeviceDirectory<T> {
        &self.directory
    }

    /// Share `group`'s key with every member device of the room lacking it.
    ///
    /// On success every delivered device is recorded in the group's
    /// [`ShakenSet`]. On failure the set is unchanged.
    ///
    /// # Errors
    ///
    /// Directory, engine or transport failure at any stage.
    pub async fn handshake(
        &self,
        identity: &Identity<C>,
        own: &Credentials,
        room_id: &RoomId,
        group: &mut OutboundGroup<C>,
    ) -> Result<HandshakeReport, SessionError> {
        let mut report = HandshakeReport {
            stage: HandshakeStage::Idle,
            devices: 0,
            claimed: 0,
            delivered: Vec::new(),
        };

        let members = self.directory.resolve_members(room_id).await?;
        advance(&mut report, room_id, HandshakeStage::MembersResolved);

        let response = self.directory.query_device_keys(&members).await?;
        let devices = Device::from_query(&response);
        report.devices = devices.len();
        advance(&mut report, room_id, HandshakeStage::KeysQueried);

        let (pending, claim) = pending_devices(devices, own, group.shaken());
        if pending.is_empty() {
            tracing::debug!(room_id = %room_id, "every member device holds the group key");
            return Ok(report);
        }

        report.claimed = pending.len();
        let claimed = self.directory.claim_one_time_keys(&claim).await?;
        advance(&mut report, room_id, HandshakeStage::KeysClaimed);

        let mut sessions = self.establish_sessions(identity, pending, &claimed)?;
        advance(&mut report, room_id, HandshakeStage::SessionsEstablished);
        if sessions.is_empty() {
            return Ok(report);
        }

        let content = RoomKeyContent::new(
            room_id.clone(),
            group.session_id(),
            group.session_key(&self.engine),
        );
        let delivery = self.send_key_delivery(identity, own, &mut sessions, &content).await?;

        for (user_id, device_id) in &delivery.recipients {
            group.shaken_mut().insert(user_id.clone(), device_id.clone());
        }
        report.delivered = delivery.recipients;
        advance(&mut report, room_id, HandshakeStage::KeysDelivered);

        tracing::info!(
            room_id = %room_id,
            session_id = group.session_id(),
            txn_id = %delivery.txn_id,
            delivered = report.delivered.len(),
            "distributed group session key"
        );
        Ok(report)
    }

    /// Create one outbound session per pending device with a claimed key.
    ///
    /// # Errors
    ///
    /// The engine rejected a peer key.
    pub fn establish_sessions(
        &self,
        identity: &Identity<C>,
        pending: Vec<Device>,
        claimed: &ClaimResponse,
    ) -> Result<Vec<PairwiseSession<C>>, SessionError> {
        let mut sessions = Vec::with_capacity(pending.len());

        for device in pending {
            let Some(one_time_key) =
                claimed.get(&device.user_id).and_then(|d| d.get(&device.device_id))
            else {
                continue;
            };

            let session = self
                .engine
                .create_outbound_session(
                    identity.account(),
                    &device.curve25519,
                    &Curve25519Key::from(one_time_key.key.as_str()),
                )
                .map_err(SessionError::encryption(Operation::CreatePairwiseSession))?;

            tracing::debug!(
                user_id = %device.user_id,
                device_id = %device.device_id,
                key_id = %one_time_key.key_id,
                "established pairwise session"
            );
            sessions.push(PairwiseSession { device, session });
        }

        Ok(sessions)
    }

    /// Encrypt `content` for every session and send one to-device batch.
    ///
    /// Each session encrypts exactly one [`RoomKeyPayload`]; the batch goes
    /// out under a fresh transaction id.
    ///
    /// # Errors
    ///
    /// Payload encoding, encryption or transport failure. Nothing is sent
    /// unless every payload encrypted.
    pub async fn send_key_delivery(
        &self,
        identity: &Identity<C>,
        own: &Credentials,
        sessions: &mut [PairwiseSession<C>],
        content: &RoomKeyContent,
    ) -> Result<KeyDelivery, SessionError> {
        let messages = self.build_key_delivery(identity, own, sessions, content)?;
        let recipients: Vec<(UserId, DeviceId)> =
            messages.iter().map(|(u, d, _)| (u.clone(), d.clone())).collect();

        let txn_id = self.env.transaction_id();
        self.transport
            .send_to_device(EventType::RoomEncrypted.as_str(), &txn_id, &messages)
            .await
            .map_err(SessionError::transport(Operation::SendToDevice))?;

        tracing::debug!(
            txn_id = %txn_id,
            devices = recipients.len(),
            session_id = %content.session_id,
            "sent room key batch"
        );
        Ok(KeyDelivery { txn_id, recipients })
    }

    fn build_key_delivery(
        &self,
        identity: &Identity<C>,
        own: &Credentials,
        sessions: &mut [PairwiseSession<C>],
        content: &RoomKeyContent,
    ) -> Result<ToDeviceMessages, SessionError> {
        let mut messages = ToDeviceMessages::new();
        let sender_key = identity.keys().curve25519.as_str();

        for pairwise in sessions.iter_mut() {
            let device = &pairwise.device;
            let payload = RoomKeyPayload::new(
                content.clone(),
                own.user_id.clone(),
                identity.keys().ed25519.as_str(),
                device.user_id.clone(),
                device.ed25519.as_str(),
            );
            let plaintext =
                to_canonical_json(&payload).map_err(SessionError::protocol(Operation::EncodePayload))?;

            let ciphertext = self
                .engine
                .encrypt_pairwise(&mut pairwise.session, &plaintext)
                .map_err(SessionError::encryption(Operation::EncryptRoomKey))?;

            let envelope = OlmEncrypted::new(
                sender_key,
                device.curve25519.as_str(),
                OlmCiphertextBody { body: ciphertext.body, message_type: ciphertext.message_type },
            );
            messages.insert(device.user_id.clone(), device.device_id.clone(), envelope);
        }

        Ok(messages)
    }
}

fn advance(report: &mut HandshakeReport, room_id: &RoomId, stage: HandshakeStage) {
    report.stage = stage;
    tracing::debug!(room_id = %room_id, stage = %stage, "handshake stage");
}
