//! The homeserver transport interface.
//!
//! Everything the orchestration layer asks of the homeserver goes through
//! [`Transport`]. Implementations perform exactly one request per call and
//! never retry; retry and backoff policy belongs to the caller.

use std::future::Future;

use herald_proto::{
    ClaimResponse, DeviceKeysResponse, DeviceId, OneTimeKeyClaim, RoomId, ToDeviceMessages,
    UserId,
    keys::{KeysUploadRequest, KeysUploadResponse},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Access credentials for one logged-in device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Fully qualified user id (`@user:server`)
    pub user_id: UserId,
    /// Device the access token belongs to
    pub device_id: DeviceId,
    /// Bearer token
    pub access_token: String,
}

/// Errors raised by a [`Transport`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No access token is available for an authenticated request.
    #[error("not logged in")]
    MissingToken,

    /// The homeserver rejected the credentials (401/403).
    #[error("unauthorized ({status}): {message}")]
    Unauthorized {
        /// HTTP status
        status: u16,
        /// Server message
        message: String,
    },

    /// Registration needs another interactive-auth stage.
    #[error("interactive authentication required")]
    AuthRequired {
        /// Interactive-auth session to continue
        session: String,
    },

    /// Any other non-success status.
    #[error("request failed ({status}): {message}")]
    Status {
        /// HTTP status
        status: u16,
        /// Server message
        message: String,
    },

    /// The request never produced a response.
    #[error("network error: {0}")]
    Network(String),

    /// The response body did not have the expected shape.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// Whether the failure means the credentials are missing or invalid.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::MissingToken | Self::Unauthorized { .. })
    }
}

/// Homeserver operations consumed by the orchestration layer.
///
/// Authenticated calls fail with [`TransportError::MissingToken`] until
/// `login` or `register` succeeded (or the transport was built from stored
/// credentials).
pub trait Transport: Send + Sync + 'static {
    /// Password login. On success the transport uses the returned token.
    fn login(
        &self,
        user: &str,
        password: &str,
    ) -> impl Future<Output = Result<Credentials, TransportError>> + Send;

    /// Register a new account.
    ///
    /// Returns [`TransportError::AuthRequired`] when the server wants an
    /// interactive-auth stage; pass the session back via `auth_session`.
    fn register(
        &self,
        user: &str,
        password: &str,
        auth_session: Option<&str>,
    ) -> impl Future<Output = Result<Credentials, TransportError>> + Send;

    /// Invalidate the current access token.
    fn logout(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Invalidate every access token of the user.
    fn logout_all(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Join a room, returning the room id the server confirmed.
    fn join_room(
        &self,
        room_id: &RoomId,
    ) -> impl Future<Output = Result<RoomId, TransportError>> + Send;

    /// Users whose membership in the room is `join`.
    fn room_members(
        &self,
        room_id: &RoomId,
    ) -> impl Future<Output = Result<Vec<UserId>, TransportError>> + Send;

    /// Device keys of every device of every listed user.
    fn query_device_keys(
        &self,
        users: &[UserId],
    ) -> impl Future<Output = Result<DeviceKeysResponse, TransportError>> + Send;

    /// Claim one one-time key per listed device.
    ///
    /// Devices with no key left are absent from the response.
    fn claim_one_time_keys(
        &self,
        claim: &OneTimeKeyClaim,
    ) -> impl Future<Output = Result<ClaimResponse, TransportError>> + Send;

    /// Publish device keys and/or one-time keys.
    fn upload_keys(
        &self,
        request: &KeysUploadRequest,
    ) -> impl Future<Output = Result<KeysUploadResponse, TransportError>> + Send;

    /// Send one room event, returning the server-assigned event id.
    fn send_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        txn_id: &str,
        content: &serde_json::Value,
    ) -> impl Future<Output = Result<String, TransportError>> + Send;

    /// Send one to-device batch.
    fn send_to_device(
        &self,
        event_type: &str,
        txn_id: &str,
        messages: &ToDeviceMessages,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_failures_are_authentication() {
        assert!(TransportError::MissingToken.is_authentication());
        assert!(
            TransportError::Unauthorized { status: 401, message: "M_UNKNOWN_TOKEN".into() }
                .is_authentication()
        );
        assert!(!TransportError::Network("reset".into()).is_authentication());
        assert!(
            !TransportError::Status { status: 500, message: "boom".into() }.is_authentication()
        );
    }

    #[test]
    fn credentials_round_trip_json_field_names() {
        let creds = Credentials {
            user_id: UserId::new("@bot:example.org"),
            device_id: DeviceId::new("DEV"),
            access_token: "tok".into(),
        };

        let value = serde_json::to_value(&creds).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "user_id": "@bot:example.org",
                "device_id": "DEV",
                "access_token": "tok",
            })
        );
    }
}
