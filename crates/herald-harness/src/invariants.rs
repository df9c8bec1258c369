//! Invariant checks over what reached the homeserver.
//!
//! A [`Snapshot`] captures the accepted traffic of a [`SimHomeserver`] plus
//! the agent's per-room key-sharing state. [`Invariant`]s then state what
//! must hold no matter which scenario produced it.
//!
//! ```ignore
//! let snapshot = Snapshot::capture(&server, &messenger, &[room]).await;
//! InvariantRegistry::standard().check_all(&snapshot)?;
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};

use herald_client::Messenger;
use herald_core::{Credentials, Environment};
use herald_crypto::CryptoEngine;
use herald_proto::{DeviceId, RoomId, UserId};

use crate::sim_homeserver::{RoomEvent, SimHomeserver, ToDeviceBatch};

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Invariant violation with context.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Name of the violated invariant
    pub invariant: &'static str,
    /// What went wrong
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// Observable state after a run.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// The agent's device
    pub own: Credentials,
    /// Accepted room events
    pub room_events: Vec<RoomEvent>,
    /// Accepted to-device batches
    pub to_device: Vec<ToDeviceBatch>,
    /// Devices holding each room's current group key, per the agent
    pub shaken: BTreeMap<RoomId, BTreeSet<(UserId, DeviceId)>>,
    /// Joined members per room, per the server
    pub members: BTreeMap<RoomId, BTreeSet<UserId>>,
}

impl Snapshot {
    /// Capture server traffic and the agent's state for `rooms`.
    pub async fn capture<C, E>(
        server: &SimHomeserver,
        messenger: &Messenger<C, SimHomeserver, E>,
        rooms: &[RoomId],
    ) -> Self
    where
        C: CryptoEngine,
        E: Environment,
    {
        let mut shaken: BTreeMap<RoomId, BTreeSet<(UserId, DeviceId)>> = BTreeMap::new();
        let mut members: BTreeMap<RoomId, BTreeSet<UserId>> = BTreeMap::new();

        for room_id in rooms {
            let room = messenger.group_sessions().lock(room_id).await;
            let devices: BTreeSet<(UserId, DeviceId)> = room
                .group()
                .map(|g| g.shaken().iter().map(|(u, d)| (u.clone(), d.clone())).collect())
                .unwrap_or_default();
            shaken.insert(room_id.clone(), devices);
            members.insert(room_id.clone(), server.members(room_id).into_iter().collect());
        }

        Self {
            own: messenger.credentials().clone(),
            room_events: server.room_events(),
            to_device: server.to_device_batches(),
            shaken,
            members,
        }
    }
}

/// A property every [`Snapshot`] must satisfy.
pub trait Invariant: Send + Sync {
    /// Name for error reporting.
    fn name(&self) -> &'static str;

    /// Check the invariant against a snapshot.
    fn check(&self, state: &Snapshot) -> InvariantResult;
}

/// Transaction ids are never reused, across room events and to-device
/// batches alike.
pub struct UniqueTransactionIds;

impl Invariant for UniqueTransactionIds {
    fn name(&self) -> &'static str {
        "unique_transaction_ids"
    }

    fn check(&self, state: &Snapshot) -> InvariantResult {
        let mut seen = HashSet::new();
        let txn_ids = state
            .room_events
            .iter()
            .map(|e| &e.txn_id)
            .chain(state.to_device.iter().map(|b| &b.txn_id));

        for txn_id in txn_ids {
            if !seen.insert(txn_id) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("transaction id {txn_id} used twice"),
                });
            }
        }
        Ok(())
    }
}

/// The agent never addresses a room key to its own device.
pub struct NoSelfDelivery;

impl Invariant for NoSelfDelivery {
    fn name(&self) -> &'static str {
        "no_self_delivery"
    }

    fn check(&self, state: &Snapshot) -> InvariantResult {
        for batch in &state.to_device {
            if batch.messages.get(&state.own.user_id, &state.own.device_id).is_some() {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("batch {} addresses the sending device", batch.txn_id),
                });
            }
        }
        for shaken in state.shaken.values() {
            if shaken.contains(&(state.own.user_id.clone(), state.own.device_id.clone())) {
                return Err(Violation {
                    invariant: self.name(),
                    message: "sending device recorded as holding the key".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// A device is only recorded as holding a room key after a batch
/// addressed to it was accepted.
pub struct ShakenImpliesDelivered;

impl Invariant for ShakenImpliesDelivered {
    fn name(&self) -> &'static str {
        "shaken_implies_delivered"
    }

    fn check(&self, state: &Snapshot) -> InvariantResult {
        for (room_id, shaken) in &state.shaken {
            for (user_id, device_id) in shaken {
                let delivered =
                    state.to_device.iter().any(|b| b.messages.get(user_id, device_id).is_some());
                if !delivered {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "room {room_id}: {user_id}/{device_id} recorded without a delivery"
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Room events only go to rooms the agent is joined to.
pub struct SendsTargetJoinedRooms;

impl Invariant for SendsTargetJoinedRooms {
    fn name(&self) -> &'static str {
        "sends_target_joined_rooms"
    }

    fn check(&self, state: &Snapshot) -> InvariantResult {
        for event in &state.room_events {
            let joined = state
                .members
                .get(&event.room_id)
                .is_some_and(|members| members.contains(&state.own.user_id));
            if !joined {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("event {} sent to unjoined room {}", event.event_id, event.room_id),
                });
            }
        }
        Ok(())
    }
}

/// Collection of invariants run together.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl InvariantRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// Every invariant in this module.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(UniqueTransactionIds);
        registry.add(NoSelfDelivery);
        registry.add(ShakenImpliesDelivered);
        registry.add(SendsTargetJoinedRooms);
        registry
    }

    /// Register an invariant.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Run every invariant, stopping at the first violation.
    pub fn check_all(&self, state: &Snapshot) -> InvariantResult {
        self.invariants.iter().try_for_each(|invariant| invariant.check(state))
    }
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use herald_proto::{OlmCiphertextBody, OlmEncrypted, ToDeviceMessages};

    use super::*;

    fn own() -> Credentials {
        Credentials {
            user_id: UserId::new("@agent:sim"),
            device_id: DeviceId::new("AGENT"),
            access_token: "t".to_string(),
        }
    }

    fn empty() -> Snapshot {
        Snapshot {
            own: own(),
            room_events: Vec::new(),
            to_device: Vec::new(),
            shaken: BTreeMap::new(),
            members: BTreeMap::new(),
        }
    }

    fn batch(txn_id: &str, user: &str, device: &str) -> ToDeviceBatch {
        let mut messages = ToDeviceMessages::new();
        messages.insert(
            UserId::new(user),
            DeviceId::new(device),
            OlmEncrypted::new("sender", "recipient", OlmCiphertextBody {
                body: "ct".to_string(),
                message_type: 0,
            }),
        );
        ToDeviceBatch { event_type: "m.room.encrypted".to_string(), txn_id: txn_id.to_string(), messages }
    }

    #[test]
    fn empty_snapshot_satisfies_everything() {
        assert!(InvariantRegistry::standard().check_all(&empty()).is_ok());
    }

    #[test]
    fn reused_transaction_id_is_caught() {
        let mut state = empty();
        state.to_device.push(batch("t1", "@bob:sim", "PHONE"));
        state.to_device.push(batch("t1", "@bob:sim", "LAPTOP"));

        let violation = UniqueTransactionIds.check(&state).unwrap_err();
        assert_eq!(violation.invariant, "unique_transaction_ids");
    }

    #[test]
    fn shaken_device_without_batch_is_caught() {
        let mut state = empty();
        let room = RoomId::new("!r:sim");
        state.to_device.push(batch("t1", "@bob:sim", "PHONE"));
        state.shaken.insert(
            room,
            BTreeSet::from([
                (UserId::new("@bob:sim"), DeviceId::new("PHONE")),
                (UserId::new("@bob:sim"), DeviceId::new("LAPTOP")),
            ]),
        );

        let violation = ShakenImpliesDelivered.check(&state).unwrap_err();
        assert!(violation.message.contains("LAPTOP"));
    }

    #[test]
    fn self_addressed_batch_is_caught() {
        let mut state = empty();
        state.to_device.push(batch("t1", "@agent:sim", "AGENT"));

        assert!(NoSelfDelivery.check(&state).is_err());
    }
}
