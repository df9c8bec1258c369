//! In-memory homeserver implementing [`Transport`].
//!
//! Holds just enough server state for the orchestration layer: accounts,
//! room membership, the device key directory and one-time key pools. Every
//! call is logged so tests can assert on what reached the server, any
//! endpoint can be made to fail once, and any endpoint can be held so a
//! call to it stays pending until released or dropped.
//!
//! Tests drive it from the outside: populate rooms and devices, run the
//! agent, then inspect [`SimHomeserver::calls`], [`SimHomeserver::room_events`]
//! and [`SimHomeserver::to_device_batches`].

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex},
};

use herald_core::{Credentials, Transport, TransportError};
use herald_proto::{
    ClaimResponse, ClaimedKey, DeviceId, DeviceKeys, DeviceKeysResponse, KeyAlgorithm, KeyId,
    OneTimeKeyClaim, RoomId, SignedOneTimeKey, ToDeviceMessages, UserId,
    keys::{KeysUploadRequest, KeysUploadResponse},
};
use tokio::sync::Notify;

/// Homeserver endpoints, as logged and as failure targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `POST /login`
    Login,
    /// `POST /register`
    Register,
    /// `POST /logout`
    Logout,
    /// `POST /logout/all`
    LogoutAll,
    /// `POST /join/{room}`
    JoinRoom,
    /// `GET /rooms/{room}/members`
    RoomMembers,
    /// `POST /keys/query`
    QueryKeys,
    /// `POST /keys/claim`
    ClaimKeys,
    /// `POST /keys/upload`
    UploadKeys,
    /// `PUT /rooms/{room}/send/{type}/{txn}`
    SendRoomEvent,
    /// `PUT /sendToDevice/{type}/{txn}`
    SendToDevice,
}

/// A room event the server accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomEvent {
    /// Target room
    pub room_id: RoomId,
    /// Event type from the URL
    pub event_type: String,
    /// Transaction id from the URL
    pub txn_id: String,
    /// Event content
    pub content: serde_json::Value,
    /// Id the server assigned
    pub event_id: String,
}

/// A to-device batch the server accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct ToDeviceBatch {
    /// Event type from the URL
    pub event_type: String,
    /// Transaction id from the URL
    pub txn_id: String,
    /// Per-device contents
    pub messages: ToDeviceMessages,
}

/// Parks the next call to one endpoint.
///
/// The parked call has had no effect on the server yet. Released, it runs
/// as usual; dropped, it never reaches the server.
#[derive(Debug, Default)]
pub struct Gate {
    arrived: Notify,
    release: Notify,
}

impl Gate {
    /// Wait until a call is parked at the gate.
    pub async fn arrived(&self) {
        self.arrived.notified().await;
    }

    /// Let the parked call through.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Debug, Clone)]
struct Account {
    password: String,
    device_id: DeviceId,
}

#[derive(Default)]
struct State {
    accounts: HashMap<UserId, Account>,
    session: Option<Credentials>,
    rooms: HashMap<RoomId, BTreeSet<UserId>>,
    devices: DeviceKeysResponse,
    one_time_keys: BTreeMap<(UserId, DeviceId), Vec<(KeyId, SignedOneTimeKey)>>,
    failures: HashMap<Endpoint, TransportError>,
    gates: HashMap<Endpoint, Arc<Gate>>,
    require_auth_stage: bool,
    next_id: u64,
    calls: Vec<Endpoint>,
    room_events: Vec<RoomEvent>,
    to_device: Vec<ToDeviceBatch>,
    claims: Vec<OneTimeKeyClaim>,
    uploads: Vec<KeysUploadRequest>,
}

impl State {
    /// Log the call, then apply the authentication check and any injected
    /// failure.
    fn enter(&mut self, endpoint: Endpoint, authenticated: bool) -> Result<(), TransportError> {
        self.calls.push(endpoint);

        if let Some(error) = self.failures.remove(&endpoint) {
            return Err(error);
        }
        if authenticated && self.session.is_none() {
            return Err(TransportError::MissingToken);
        }
        Ok(())
    }

    fn own(&self) -> Result<Credentials, TransportError> {
        self.session.clone().ok_or(TransportError::MissingToken)
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn start_session(&mut self, user_id: UserId, device_id: DeviceId) -> Credentials {
        let n = self.next_id();
        let credentials = Credentials { user_id, device_id, access_token: format!("token-{n}") };
        self.session = Some(credentials.clone());
        credentials
    }

    fn key_count(&self, user_id: &UserId, device_id: &DeviceId) -> u64 {
        let count = self
            .one_time_keys
            .get(&(user_id.clone(), device_id.clone()))
            .map_or(0, Vec::len);
        u64::try_from(count).unwrap_or(u64::MAX)
    }
}

/// In-memory homeserver for one agent device.
#[derive(Default)]
pub struct SimHomeserver {
    state: Mutex<State>,
}

impl SimHomeserver {
    /// Empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Server already holding `credentials` as the active session.
    pub fn logged_in(credentials: Credentials) -> Self {
        let server = Self::new();
        {
            let mut state = server.state();
            state.accounts.insert(
                credentials.user_id.clone(),
                Account { password: String::new(), device_id: credentials.device_id.clone() },
            );
            state.session = Some(credentials);
        }
        server
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("sim homeserver lock poisoned")
    }

    /// Create an account that can log in with `password`.
    ///
    /// Logins hand out `device_id` as the new device.
    pub fn add_account(&self, user_id: UserId, password: &str, device_id: DeviceId) {
        self.state()
            .accounts
            .insert(user_id, Account { password: password.to_string(), device_id });
    }

    /// Make registration answer with an interactive-auth stage first.
    pub fn require_auth_stage(&self) {
        self.state().require_auth_stage = true;
    }

    /// Add `user_id` to the joined members of `room_id`.
    pub fn add_member(&self, room_id: &RoomId, user_id: UserId) {
        self.state().rooms.entry(room_id.clone()).or_default().insert(user_id);
    }

    /// Publish a device in the key directory.
    pub fn add_device(&self, device_keys: DeviceKeys) {
        self.state()
            .devices
            .entry(device_keys.user_id.clone())
            .or_default()
            .insert(device_keys.device_id.clone(), device_keys);
    }

    /// Add one claimable one-time key for a device.
    pub fn add_one_time_key(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        key_id: KeyId,
        key: SignedOneTimeKey,
    ) {
        self.state()
            .one_time_keys
            .entry((user_id.clone(), device_id.clone()))
            .or_default()
            .push((key_id, key));
    }

    /// Remove every unclaimed one-time key of a device.
    pub fn drain_one_time_keys(&self, user_id: &UserId, device_id: &DeviceId) {
        self.state().one_time_keys.remove(&(user_id.clone(), device_id.clone()));
    }

    /// Unclaimed one-time keys held for a device.
    pub fn one_time_key_count(&self, user_id: &UserId, device_id: &DeviceId) -> u64 {
        self.state().key_count(user_id, device_id)
    }

    /// Make the next call to `endpoint` fail with `error`.
    pub fn fail(&self, endpoint: Endpoint, error: TransportError) {
        self.state().failures.insert(endpoint, error);
    }

    /// Hold the next call to `endpoint` at a [`Gate`].
    ///
    /// A call is logged in [`SimHomeserver::calls`] only once it passes.
    pub fn hold(&self, endpoint: Endpoint) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.state().gates.insert(endpoint, Arc::clone(&gate));
        gate
    }

    async fn pass(&self, endpoint: Endpoint) {
        let gate = self.state().gates.remove(&endpoint);
        if let Some(gate) = gate {
            gate.arrived.notify_one();
            gate.release.notified().await;
        }
    }

    /// Every call in order, including failed ones.
    pub fn calls(&self) -> Vec<Endpoint> {
        self.state().calls.clone()
    }

    /// Number of calls to `endpoint`.
    pub fn count(&self, endpoint: Endpoint) -> usize {
        self.state().calls.iter().filter(|&&c| c == endpoint).count()
    }

    /// Accepted room events.
    pub fn room_events(&self) -> Vec<RoomEvent> {
        self.state().room_events.clone()
    }

    /// Accepted to-device batches.
    pub fn to_device_batches(&self) -> Vec<ToDeviceBatch> {
        self.state().to_device.clone()
    }

    /// Claim requests received, including failed ones.
    pub fn claims(&self) -> Vec<OneTimeKeyClaim> {
        self.state().claims.clone()
    }

    /// Accepted key uploads.
    pub fn uploads(&self) -> Vec<KeysUploadRequest> {
        self.state().uploads.clone()
    }

    /// Joined members of a room.
    pub fn members(&self, room_id: &RoomId) -> Vec<UserId> {
        self.state().rooms.get(room_id).map(|m| m.iter().cloned().collect()).unwrap_or_default()
    }

    /// Directory entry of a device.
    pub fn device(&self, user_id: &UserId, device_id: &DeviceId) -> Option<DeviceKeys> {
        self.state().devices.get(user_id).and_then(|d| d.get(device_id)).cloned()
    }
}

impl Transport for SimHomeserver {
    async fn login(&self, user: &str, password: &str) -> Result<Credentials, TransportError> {
        self.pass(Endpoint::Login).await;
        let mut state = self.state();
        state.enter(Endpoint::Login, false)?;

        let user_id = UserId::new(user);
        let account = state
            .accounts
            .get(&user_id)
            .filter(|a| a.password == password)
            .cloned()
            .ok_or_else(|| TransportError::Unauthorized {
                status: 403,
                message: "M_FORBIDDEN: invalid username or password".to_string(),
            })?;

        Ok(state.start_session(user_id, account.device_id))
    }

    async fn register(
        &self,
        user: &str,
        password: &str,
        auth_session: Option<&str>,
    ) -> Result<Credentials, TransportError> {
        self.pass(Endpoint::Register).await;
        let mut state = self.state();
        state.enter(Endpoint::Register, false)?;

        if state.require_auth_stage && auth_session.is_none() {
            let n = state.next_id();
            return Err(TransportError::AuthRequired { session: format!("uia-{n}") });
        }

        let user_id = UserId::new(user);
        if state.accounts.contains_key(&user_id) {
            return Err(TransportError::Status {
                status: 400,
                message: "M_USER_IN_USE: user id already taken".to_string(),
            });
        }

        let n = state.next_id();
        let device_id = DeviceId::new(format!("SIMDEVICE{n}"));
        state.accounts.insert(
            user_id.clone(),
            Account { password: password.to_string(), device_id: device_id.clone() },
        );
        Ok(state.start_session(user_id, device_id))
    }

    async fn logout(&self) -> Result<(), TransportError> {
        self.pass(Endpoint::Logout).await;
        let mut state = self.state();
        state.enter(Endpoint::Logout, true)?;
        state.session = None;
        Ok(())
    }

    async fn logout_all(&self) -> Result<(), TransportError> {
        self.pass(Endpoint::LogoutAll).await;
        let mut state = self.state();
        state.enter(Endpoint::LogoutAll, true)?;
        state.session = None;
        Ok(())
    }

    async fn join_room(&self, room_id: &RoomId) -> Result<RoomId, TransportError> {
        self.pass(Endpoint::JoinRoom).await;
        let mut state = self.state();
        state.enter(Endpoint::JoinRoom, true)?;

        let own = state.own()?;
        state.rooms.entry(room_id.clone()).or_default().insert(own.user_id);
        Ok(room_id.clone())
    }

    async fn room_members(&self, room_id: &RoomId) -> Result<Vec<UserId>, TransportError> {
        self.pass(Endpoint::RoomMembers).await;
        let mut state = self.state();
        state.enter(Endpoint::RoomMembers, true)?;

        state.rooms.get(room_id).map(|m| m.iter().cloned().collect()).ok_or_else(|| {
            TransportError::Status { status: 404, message: format!("M_NOT_FOUND: {room_id}") }
        })
    }

    async fn query_device_keys(
        &self,
        users: &[UserId],
    ) -> Result<DeviceKeysResponse, TransportError> {
        self.pass(Endpoint::QueryKeys).await;
        let mut state = self.state();
        state.enter(Endpoint::QueryKeys, true)?;

        Ok(users
            .iter()
            .filter_map(|u| state.devices.get(u).map(|d| (u.clone(), d.clone())))
            .collect())
    }

    async fn claim_one_time_keys(
        &self,
        claim: &OneTimeKeyClaim,
    ) -> Result<ClaimResponse, TransportError> {
        self.pass(Endpoint::ClaimKeys).await;
        let mut state = self.state();
        state.claims.push(claim.clone());
        state.enter(Endpoint::ClaimKeys, true)?;

        let mut response = ClaimResponse::new();
        for (user_id, devices) in claim {
            for (device_id, algorithm) in devices {
                let pool = state.one_time_keys.get_mut(&(user_id.clone(), device_id.clone()));
                let position = pool
                    .as_ref()
                    .and_then(|keys| keys.iter().position(|(id, _)| id.is(*algorithm)));

                let (Some(keys), Some(position)) = (pool, position) else {
                    continue;
                };
                let (key_id, signed) = keys.remove(position);
                response.entry(user_id.clone()).or_default().insert(
                    device_id.clone(),
                    ClaimedKey { key_id, key: signed.key, signatures: signed.signatures },
                );
            }
        }

        Ok(response)
    }

    async fn upload_keys(
        &self,
        request: &KeysUploadRequest,
    ) -> Result<KeysUploadResponse, TransportError> {
        self.pass(Endpoint::UploadKeys).await;
        let mut state = self.state();
        state.enter(Endpoint::UploadKeys, true)?;
        let own = state.own()?;

        if let Some(device_keys) = &request.device_keys {
            state
                .devices
                .entry(own.user_id.clone())
                .or_default()
                .insert(own.device_id.clone(), device_keys.clone());
        }

        for (raw_id, key) in &request.one_time_keys {
            let key_id = KeyId::parse(raw_id)
                .map_err(|e| TransportError::Status { status: 400, message: e.to_string() })?;
            state
                .one_time_keys
                .entry((own.user_id.clone(), own.device_id.clone()))
                .or_default()
                .push((key_id, key.clone()));
        }
        state.uploads.push(request.clone());

        let count = state.key_count(&own.user_id, &own.device_id);
        Ok(KeysUploadResponse {
            one_time_key_counts: BTreeMap::from([(
                KeyAlgorithm::SignedCurve25519.as_str().to_string(),
                count,
            )]),
        })
    }

    async fn send_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        txn_id: &str,
        content: &serde_json::Value,
    ) -> Result<String, TransportError> {
        self.pass(Endpoint::SendRoomEvent).await;
        let mut state = self.state();
        state.enter(Endpoint::SendRoomEvent, true)?;

        let event_id = format!("$event{}", state.next_id());
        state.room_events.push(RoomEvent {
            room_id: room_id.clone(),
            event_type: event_type.to_string(),
            txn_id: txn_id.to_string(),
            content: content.clone(),
            event_id: event_id.clone(),
        });
        Ok(event_id)
    }

    async fn send_to_device(
        &self,
        event_type: &str,
        txn_id: &str,
        messages: &ToDeviceMessages,
    ) -> Result<(), TransportError> {
        self.pass(Endpoint::SendToDevice).await;
        let mut state = self.state();
        state.enter(Endpoint::SendToDevice, true)?;

        state.to_device.push(ToDeviceBatch {
            event_type: event_type.to_string(),
            txn_id: txn_id.to_string(),
            messages: messages.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Credentials {
        Credentials {
            user_id: UserId::new("@alice:sim"),
            device_id: DeviceId::new("ALICE"),
            access_token: "token".to_string(),
        }
    }

    fn signed(key: &str) -> SignedOneTimeKey {
        SignedOneTimeKey { key: key.to_string(), signatures: BTreeMap::new() }
    }

    #[tokio::test]
    async fn unauthenticated_calls_fail_before_any_effect() {
        let server = SimHomeserver::new();
        let room = RoomId::new("!r:sim");

        let result = server.join_room(&room).await;
        assert_eq!(result, Err(TransportError::MissingToken));
        assert!(server.members(&room).is_empty());
    }

    #[tokio::test]
    async fn claim_hands_out_each_key_once() {
        let server = SimHomeserver::logged_in(alice());
        let bob = UserId::new("@bob:sim");
        let phone = DeviceId::new("PHONE");
        server.add_one_time_key(
            &bob,
            &phone,
            KeyId::new(KeyAlgorithm::SignedCurve25519, "AAAAAQ"),
            signed("key1"),
        );

        let claim = OneTimeKeyClaim::from([(
            bob.clone(),
            BTreeMap::from([(phone.clone(), KeyAlgorithm::SignedCurve25519)]),
        )]);

        let first = server.claim_one_time_keys(&claim).await.unwrap();
        assert_eq!(first[&bob][&phone].key, "key1");

        let second = server.claim_one_time_keys(&claim).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(server.claims().len(), 2);
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let server = SimHomeserver::logged_in(alice());
        server.fail(Endpoint::SendToDevice, TransportError::Network("reset".into()));

        let batch = ToDeviceMessages::new();
        assert!(server.send_to_device("m.room.encrypted", "t1", &batch).await.is_err());
        assert!(server.send_to_device("m.room.encrypted", "t2", &batch).await.is_ok());

        assert_eq!(server.count(Endpoint::SendToDevice), 2);
        assert_eq!(server.to_device_batches().len(), 1);
        assert_eq!(server.to_device_batches()[0].txn_id, "t2");
    }

    #[tokio::test]
    async fn held_call_has_no_effect_until_released() {
        let server = SimHomeserver::logged_in(alice());
        let room = RoomId::new("!r:sim");
        let gate = server.hold(Endpoint::JoinRoom);

        let mut join = std::pin::pin!(server.join_room(&room));
        tokio::select! {
            biased;
            _ = join.as_mut() => panic!("held join completed"),
            () = gate.arrived() => {},
        }
        assert!(server.members(&room).is_empty());
        assert_eq!(server.count(Endpoint::JoinRoom), 0);

        gate.release();
        assert_eq!(join.await.unwrap(), room);
        assert_eq!(server.members(&room), vec![UserId::new("@alice:sim")]);

        // The gate is spent; the next join passes straight through.
        assert!(server.join_room(&room).await.is_ok());
    }

    #[tokio::test]
    async fn registration_with_auth_stage() {
        let server = SimHomeserver::new();
        server.require_auth_stage();

        let Err(TransportError::AuthRequired { session }) =
            server.register("@carol:sim", "pw", None).await
        else {
            panic!("expected an interactive-auth stage");
        };

        let credentials = server.register("@carol:sim", "pw", Some(&session)).await.unwrap();
        assert_eq!(credentials.user_id.as_str(), "@carol:sim");
        assert!(server.login("@carol:sim", "pw").await.is_ok());
        assert!(server.login("@carol:sim", "wrong").await.is_err());
    }
}
