//! Message encryption pipeline.
//!
//! [`Messenger`] is the agent as callers see it: one logged-in device that
//! can join rooms and send plain or encrypted events. Encrypted sends run the
//! whole pipeline under the room's lock:
//!
//! ```text
//! join ─► group session ─► handshake ─► encrypt ─► send room event
//! ```
//!
//! # Invariants
//!
//! - Every room event and every to-device batch gets its own transaction id
//! - A group session created by a send is kept only once that send's room
//!   event was accepted; a failed or dropped send leaves the room as it was
//! - Sends to one room never interleave

use std::{collections::HashSet, path::PathBuf, sync::Arc};

use herald_core::{
    Credentials, Device, Environment, GroupSessionInfo, GroupSessionManager, Identity, IdentityError,
    IdentityStore, KeyDelivery, KeyPublisher, Operation, OutboundGroup, PairwiseSession,
    PairwiseSessionManager, PublishReport, SessionError, Transport,
};
use herald_crypto::{CryptoEngine, IdentityKeys};
use herald_proto::{
    ClaimResponse, EventType, MegolmEncrypted, ProtocolError, RoomEventPayload, RoomId, RoomKeyContent,
    RoomMessageContent, to_canonical_json,
};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use crate::{config::ClientConfig, plain_text::html_to_text};

/// A logged-in device sending to rooms.
pub struct Messenger<C: CryptoEngine, T: Transport, E: Environment> {
    engine: Arc<C>,
    transport: Arc<T>,
    env: E,
    credentials: Credentials,
    identity: RwLock<Identity<C>>,
    store: IdentityStore<C>,
    identity_path: PathBuf,
    rooms: GroupSessionManager<C>,
    pairwise: PairwiseSessionManager<C, T, E>,
    publisher: KeyPublisher<C, T>,
    joined: Mutex<HashSet<RoomId>>,
}

impl<C: CryptoEngine, T: Transport, E: Environment> Messenger<C, T, E> {
    /// Messenger for `credentials` using an already loaded identity.
    pub fn new(
        engine: Arc<C>,
        transport: Arc<T>,
        env: E,
        credentials: Credentials,
        identity: Identity<C>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            store: IdentityStore::new(Arc::clone(&engine), config.one_time_keys),
            identity_path: config.identity_path.clone(),
            rooms: GroupSessionManager::new(Arc::clone(&engine)),
            pairwise: PairwiseSessionManager::new(
                Arc::clone(&engine),
                Arc::clone(&transport),
                env.clone(),
            ),
            publisher: KeyPublisher::new(Arc::clone(&engine), Arc::clone(&transport)),
            identity: RwLock::new(identity),
            joined: Mutex::new(HashSet::new()),
            engine,
            transport,
            env,
            credentials,
        }
    }

    /// Messenger for `credentials`, loading the identity from
    /// `config.identity_path` or creating it there.
    ///
    /// # Errors
    ///
    /// The identity exists but cannot be read.
    pub fn open(
        engine: Arc<C>,
        transport: Arc<T>,
        env: E,
        credentials: Credentials,
        config: &ClientConfig,
    ) -> Result<Self, IdentityError> {
        let store = IdentityStore::new(Arc::clone(&engine), config.one_time_keys);
        let identity = store.load_or_create(&config.identity_path)?;

        Ok(Self::new(engine, transport, env, credentials, identity, config))
    }

    /// Credentials of this device.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Public identity keys of this device.
    pub async fn identity_keys(&self) -> IdentityKeys {
        self.identity.read().await.keys().clone()
    }

    /// Per-room group session state.
    pub fn group_sessions(&self) -> &GroupSessionManager<C> {
        &self.rooms
    }

    /// The transport this messenger sends through.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Upload device keys and top up one-time keys.
    pub async fn publish_keys(&self) -> Result<PublishReport, SessionError> {
        let mut identity = self.identity.write().await;
        self.publisher
            .publish(&mut identity, &self.credentials, &self.store, &self.identity_path)
            .await
    }

    /// Join `room_id`.
    ///
    /// Rooms joined earlier by this messenger are not joined again. The
    /// joined set is not locked while the join is in flight, so two racing
    /// first sends may both join; joining twice is harmless.
    pub async fn join_room(&self, room_id: &RoomId) -> Result<RoomId, SessionError> {
        if self.joined.lock().await.contains(room_id) {
            return Ok(room_id.clone());
        }

        let confirmed = self
            .transport
            .join_room(room_id)
            .await
            .map_err(SessionError::transport(Operation::JoinRoom))?;

        tracing::info!(room_id = %confirmed, "joined room");
        let mut joined = self.joined.lock().await;
        joined.insert(room_id.clone());
        joined.insert(confirmed.clone());
        Ok(confirmed)
    }

    /// Send an unencrypted HTML message with a plain-text fallback.
    ///
    /// Joins the room first if needed. Returns the event id.
    pub async fn send(&self, room_id: &RoomId, message: &str) -> Result<String, SessionError> {
        let room_id = self.join_room(room_id).await?;
        let content = RoomMessageContent::html(html_to_text(message), message);

        self.send_event(&room_id, EventType::RoomMessage.as_str(), &content).await
    }

    /// Send an HTML message encrypted under the room's group session.
    ///
    /// Joins the room first if needed. Returns the event id.
    pub async fn send_encrypted(
        &self,
        room_id: &RoomId,
        message: &str,
    ) -> Result<String, SessionError> {
        let room_id = self.join_room(room_id).await?;
        let content = RoomMessageContent::html(html_to_text(message), message);

        self.send_encrypted_event(&room_id, EventType::RoomMessage.as_str(), &content).await
    }

    /// Send an arbitrary unencrypted room event.
    pub async fn send_event<P: Serialize + Sync>(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &P,
    ) -> Result<String, SessionError> {
        let body = serde_json::to_value(content)
            .map_err(ProtocolError::from)
            .map_err(SessionError::protocol(Operation::EncodePayload))?;

        let txn_id = self.env.transaction_id();
        let event_id = self
            .transport
            .send_room_event(room_id, event_type, &txn_id, &body)
            .await
            .map_err(SessionError::transport(Operation::SendRoomEvent))?;

        tracing::info!(room_id = %room_id, txn_id = %txn_id, event_type, "sent room event");
        Ok(event_id)
    }

    /// Send an arbitrary room event encrypted under the room's group session.
    ///
    /// Distributes the session key to member devices lacking it first. The
    /// room must already be joined.
    ///
    /// # Errors
    ///
    /// Any handshake failure aborts before the event is encrypted; nothing
    /// is sent to the room.
    pub async fn send_encrypted_event<P: Serialize + Sync>(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &P,
    ) -> Result<String, SessionError> {
        let identity = self.identity.read().await;
        let mut room = self.rooms.lock(room_id).await;

        let mut staged = None;
        let group = match room.group_mut() {
            Some(group) => group,
            None => staged.insert(OutboundGroup::new(&*self.engine)),
        };

        self.pairwise.handshake(&identity, &self.credentials, room_id, group).await?;

        let payload = RoomEventPayload {
            event_type: event_type.to_string(),
            content,
            room_id: room_id.clone(),
        };
        let plaintext =
            to_canonical_json(&payload).map_err(SessionError::protocol(Operation::EncodePayload))?;
        let ciphertext = group
            .encrypt(&self.engine, &plaintext)
            .map_err(SessionError::encryption(Operation::EncryptRoomEvent))?;

        let envelope = MegolmEncrypted::new(
            identity.keys().curve25519.as_str(),
            self.credentials.device_id.clone(),
            group.session_id(),
            ciphertext,
        );
        let body = serde_json::to_value(&envelope)
            .map_err(ProtocolError::from)
            .map_err(SessionError::protocol(Operation::EncodePayload))?;

        let txn_id = self.env.transaction_id();
        let event_id = self
            .transport
            .send_room_event(room_id, EventType::RoomEncrypted.as_str(), &txn_id, &body)
            .await
            .map_err(SessionError::transport(Operation::SendRoomEvent))?;

        if let Some(group) = staged {
            tracing::info!(room_id = %room_id, session_id = group.session_id(), "created group session");
            room.install(group);
        }

        tracing::info!(
            room_id = %room_id,
            txn_id = %txn_id,
            session_id = %envelope.session_id,
            event_type,
            "sent encrypted room event"
        );
        Ok(event_id)
    }

    /// Open one pairwise session to each pending device that has a claimed
    /// one-time key, for use with [`Messenger::send_key_delivery`].
    pub async fn establish_sessions(
        &self,
        pending: Vec<Device>,
        claimed: &ClaimResponse,
    ) -> Result<Vec<PairwiseSession<C>>, SessionError> {
        let identity = self.identity.read().await;
        self.pairwise.establish_sessions(&identity, pending, claimed)
    }

    /// Deliver `group`'s key over the given pairwise sessions as one
    /// to-device batch.
    pub async fn send_key_delivery(
        &self,
        sessions: &mut [PairwiseSession<C>],
        group: &GroupSessionInfo,
    ) -> Result<KeyDelivery, SessionError> {
        let identity = self.identity.read().await;
        let content =
            RoomKeyContent::new(group.room_id.clone(), &group.session_id, &group.session_key);

        self.pairwise.send_key_delivery(&identity, &self.credentials, sessions, &content).await
    }

    /// Replace the room's group session.
    ///
    /// The next encrypted send re-distributes the new key to every member
    /// device.
    pub async fn rotate_room_key(&self, room_id: &RoomId) -> GroupSessionInfo {
        self.rooms.rotate(room_id).await
    }

    /// Invalidate this device's access token.
    pub async fn logout(&self) -> Result<(), SessionError> {
        crate::account::logout(&*self.transport, false).await
    }

    /// Invalidate every access token of the user.
    pub async fn logout_all(&self) -> Result<(), SessionError> {
        crate::account::logout(&*self.transport, true).await
    }
}
