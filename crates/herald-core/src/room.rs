//! Per-room session state and the group session manager.
//!
//! Each room owns at most one outbound group session together with the set of
//! devices that already hold its key. Both live in a [`RoomState`] behind a
//! per-room async lock, so concurrent sends to one room are serialized while
//! different rooms proceed independently.
//!
//! # Invariants
//!
//! - At most one live group session per room
//! - A [`ShakenSet`] belongs to exactly one group session: a device in it
//!   holds that session's key
//! - Replacing the session (rotation) starts an empty [`ShakenSet`]

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use herald_crypto::{CryptoEngine, CryptoError};
use herald_proto::{DeviceId, RoomId, UserId};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Devices that already received the current group session key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShakenSet {
    devices: HashSet<(UserId, DeviceId)>,
}

impl ShakenSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the device already holds the key.
    pub fn contains(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        self.devices.contains(&(user_id.clone(), device_id.clone()))
    }

    /// Record a delivered key. Returns `false` if the device was present.
    pub fn insert(&mut self, user_id: UserId, device_id: DeviceId) -> bool {
        self.devices.insert((user_id, device_id))
    }

    /// Number of devices holding the key.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device holds the key yet.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Iterate over `(user, device)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &DeviceId)> {
        self.devices.iter().map(|(u, d)| (u, d))
    }
}

/// An outbound group session and the devices it was shared with.
pub struct OutboundGroup<C: CryptoEngine> {
    session: C::GroupSession,
    session_id: String,
    shaken: ShakenSet,
}

impl<C: CryptoEngine> OutboundGroup<C> {
    /// Fresh session, shared with nobody.
    pub fn new(engine: &C) -> Self {
        let session = engine.create_group_session();
        let session_id = engine.group_session_id(&session);
        Self { session, session_id, shaken: ShakenSet::new() }
    }

    /// Session id.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Exportable session key at the current ratchet index.
    pub fn session_key(&self, engine: &C) -> String {
        engine.group_session_key(&self.session)
    }

    /// Devices holding the key.
    pub fn shaken(&self) -> &ShakenSet {
        &self.shaken
    }

    /// Devices holding the key, for recording deliveries.
    pub fn shaken_mut(&mut self) -> &mut ShakenSet {
        &mut self.shaken
    }

    /// Encrypt a room event payload, advancing the ratchet.
    pub fn encrypt(&mut self, engine: &C, plaintext: &str) -> Result<String, CryptoError> {
        engine.encrypt_group(&mut self.session, plaintext)
    }
}

/// State of one room.
pub struct RoomState<C: CryptoEngine> {
    group: Option<OutboundGroup<C>>,
}

impl<C: CryptoEngine> Default for RoomState<C> {
    fn default() -> Self {
        Self { group: None }
    }
}

impl<C: CryptoEngine> RoomState<C> {
    /// The live group session, if one was created.
    pub fn group(&self) -> Option<&OutboundGroup<C>> {
        self.group.as_ref()
    }

    /// The live group session, mutably.
    pub fn group_mut(&mut self) -> Option<&mut OutboundGroup<C>> {
        self.group.as_mut()
    }

    /// Install `group` as the live session, returning the one it replaces.
    pub fn install(&mut self, group: OutboundGroup<C>) -> Option<OutboundGroup<C>> {
        self.group.replace(group)
    }
}

/// Exclusive access to one room's state.
pub type RoomGuard<C> = OwnedMutexGuard<RoomState<C>>;

/// Public view of a room's group session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSessionInfo {
    /// Room the session encrypts for
    pub room_id: RoomId,
    /// Session id
    pub session_id: String,
    /// Exportable session key
    pub session_key: String,
}

/// Keyed store of room states: room id → [`RoomState`].
pub struct GroupSessionManager<C: CryptoEngine> {
    engine: Arc<C>,
    rooms: Mutex<HashMap<RoomId, Arc<Mutex<RoomState<C>>>>>,
}

impl<C: CryptoEngine> GroupSessionManager<C> {
    /// Empty store.
    pub fn new(engine: Arc<C>) -> Self {
        Self { engine, rooms: Mutex::new(HashMap::new()) }
    }

    /// Lock one room's state, creating an empty state on first use.
    ///
    /// The guard serializes every handshake and send for the room.
    pub async fn lock(&self, room_id: &RoomId) -> RoomGuard<C> {
        let room = {
            let mut rooms = self.rooms.lock().await;
            Arc::clone(rooms.entry(room_id.clone()).or_default())
        };
        room.lock_owned().await
    }

    /// The room's group session, creating one on first use.
    pub async fn get_or_create(&self, room_id: &RoomId) -> GroupSessionInfo {
        let mut room = self.lock(room_id).await;

        if room.group().is_none() {
            let group = OutboundGroup::new(&*self.engine);
            tracing::info!(room_id = %room_id, session_id = group.session_id(), "created group session");
            room.install(group);
        }

        self.info(room_id, &room)
    }

    /// Replace the room's group session with a fresh one.
    ///
    /// The new session starts with no shaken devices, so the next encrypted
    /// send re-distributes the key to every member device.
    pub async fn rotate(&self, room_id: &RoomId) -> GroupSessionInfo {
        let mut room = self.lock(room_id).await;

        let group = OutboundGroup::new(&*self.engine);
        let new_id = group.session_id().to_string();
        let previous = room.install(group);

        tracing::info!(
            room_id = %room_id,
            session_id = %new_id,
            previous_session_id = previous.as_ref().map(OutboundGroup::session_id),
            "rotated group session"
        );

        self.info(room_id, &room)
    }

    /// The room's group session, if one exists.
    pub async fn current(&self, room_id: &RoomId) -> Option<GroupSessionInfo> {
        let room = self.lock(room_id).await;
        room.group().map(|_| self.info(room_id, &room))
    }

    /// Whether the device holds the room's current group session key.
    pub async fn is_shaken(&self, room_id: &RoomId, user_id: &UserId, device_id: &DeviceId) -> bool {
        let room = self.lock(room_id).await;
        room.group().is_some_and(|g| g.shaken().contains(user_id, device_id))
    }

    fn info(&self, room_id: &RoomId, room: &RoomState<C>) -> GroupSessionInfo {
        // Callers only reach here with a session installed.
        let (session_id, session_key) = room
            .group()
            .map(|g| (g.session_id().to_string(), g.session_key(&self.engine)))
            .unwrap_or_default();

        GroupSessionInfo { room_id: room_id.clone(), session_id, session_key }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn shaken_set_is_keyed_by_user_and_device() {
        let mut shaken = ShakenSet::new();
        shaken.insert(UserId::new("@a:x"), DeviceId::new("DEV"));

        assert!(shaken.contains(&UserId::new("@a:x"), &DeviceId::new("DEV")));
        assert!(!shaken.contains(&UserId::new("@b:x"), &DeviceId::new("DEV")));
    }

    #[test]
    fn reinserting_a_device_is_a_no_op() {
        let mut shaken = ShakenSet::new();
        assert!(shaken.insert(UserId::new("@a:x"), DeviceId::new("DEV")));
        assert!(!shaken.insert(UserId::new("@a:x"), DeviceId::new("DEV")));
        assert_eq!(shaken.len(), 1);
    }

    proptest! {
        #[test]
        fn every_inserted_pair_is_contained(
            pairs in prop::collection::vec(("[a-c]", "[A-C]{1,2}"), 0..20)
        ) {
            let mut shaken = ShakenSet::new();
            for (user, device) in &pairs {
                shaken.insert(UserId::new(format!("@{user}:x")), DeviceId::new(device.as_str()));
            }

            for (user, device) in &pairs {
                let user_id = UserId::new(format!("@{user}:x"));
                let device_id = DeviceId::new(device.as_str());
                prop_assert!(shaken.contains(&user_id, &device_id));
            }
            prop_assert!(shaken.len() <= pairs.len());
        }
    }
}
