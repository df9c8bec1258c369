//! Device key directory: who is in a room and which keys their devices hold.
//!
//! A thin layer over the [`Transport`] directory calls that attributes
//! failures to an [`Operation`] and turns raw query results into [`Device`]
//! records. Nothing is cached; every handshake asks again.

use std::sync::Arc;

use herald_crypto::{Curve25519Key, Ed25519Key};
use herald_proto::{
    ClaimResponse, DeviceId, DeviceKeysResponse, KeyAlgorithm, OneTimeKeyClaim, RoomId, UserId,
};

use crate::{
    error::{Operation, SessionError},
    transport::Transport,
};

/// A remote device with both identity keys known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Owner
    pub user_id: UserId,
    /// Device id, unique per user
    pub device_id: DeviceId,
    /// Curve25519 identity key (`curve25519:<device_id>`)
    pub curve25519: Curve25519Key,
    /// Ed25519 fingerprint key (`ed25519:<device_id>`)
    pub ed25519: Ed25519Key,
}

impl Device {
    /// Extract every device that published both identity keys.
    ///
    /// Devices missing either key cannot receive a room key and are skipped,
    /// as are entries whose body names another user or device than the one
    /// it is listed under.
    pub fn from_query(response: &DeviceKeysResponse) -> Vec<Self> {
        let mut devices = Vec::new();

        for (user_id, user_devices) in response {
            for (device_id, keys) in user_devices {
                if &keys.user_id != user_id || &keys.device_id != device_id {
                    tracing::warn!(
                        user_id = %user_id,
                        device_id = %device_id,
                        claimed_user_id = %keys.user_id,
                        claimed_device_id = %keys.device_id,
                        "device keys do not match their directory entry, skipping"
                    );
                    continue;
                }

                match (keys.key(KeyAlgorithm::Curve25519), keys.key(KeyAlgorithm::Ed25519)) {
                    (Some(curve25519), Some(ed25519)) => devices.push(Self {
                        user_id: user_id.clone(),
                        device_id: device_id.clone(),
                        curve25519: Curve25519Key::from(curve25519),
                        ed25519: Ed25519Key::from(ed25519),
                    }),
                    _ => tracing::warn!(
                        user_id = %user_id,
                        device_id = %device_id,
                        "device is missing identity keys, skipping"
                    ),
                }
            }
        }

        devices
    }
}

/// Membership and key lookups against the homeserver.
pub struct DeviceDirectory<T: Transport> {
    transport: Arc<T>,
}

impl<T: Transport> Clone for DeviceDirectory<T> {
    fn clone(&self) -> Self {
        Self { transport: Arc::clone(&self.transport) }
    }
}

impl<T: Transport> DeviceDirectory<T> {
    /// Directory backed by `transport`.
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    /// Users currently joined to the room.
    pub async fn resolve_members(&self, room_id: &RoomId) -> Result<Vec<UserId>, SessionError> {
        let members = self
            .transport
            .room_members(room_id)
            .await
            .map_err(SessionError::directory(Operation::ResolveMembers))?;

        tracing::debug!(room_id = %room_id, members = members.len(), "resolved room members");
        Ok(members)
    }

    /// Device keys of every device of `users`.
    pub async fn query_device_keys(
        &self,
        users: &[UserId],
    ) -> Result<DeviceKeysResponse, SessionError> {
        self.transport
            .query_device_keys(users)
            .await
            .map_err(SessionError::directory(Operation::QueryDeviceKeys))
    }

    /// Claim one one-time key for each wanted device.
    ///
    /// A device the directory has no key for is missing from the result; it
    /// is logged and otherwise ignored.
    pub async fn claim_one_time_keys(
        &self,
        wanted: &OneTimeKeyClaim,
    ) -> Result<ClaimResponse, SessionError> {
        let claimed = self
            .transport
            .claim_one_time_keys(wanted)
            .await
            .map_err(SessionError::directory(Operation::ClaimOneTimeKeys))?;

        for (user_id, devices) in wanted {
            for device_id in devices.keys() {
                let found = claimed.get(user_id).is_some_and(|d| d.contains_key(device_id));
                if !found {
                    tracing::warn!(
                        user_id = %user_id,
                        device_id = %device_id,
                        "no one-time key left for device, skipping"
                    );
                }
            }
        }

        Ok(claimed)
    }
}
