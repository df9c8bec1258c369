//! Error taxonomy for session orchestration.
//!
//! Every error that reaches a caller names the [`Operation`] that failed.
//! Credential failures are lifted into [`SessionError::Authentication`]
//! whichever operation hit them.

use std::{fmt, path::PathBuf};

use herald_crypto::CryptoError;
use herald_proto::ProtocolError;
use thiserror::Error;

use crate::transport::TransportError;

/// Operation a [`SessionError`] is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Password login
    Login,
    /// Account registration
    Register,
    /// Token invalidation
    Logout,
    /// Joining a room
    JoinRoom,
    /// Listing joined room members
    ResolveMembers,
    /// Device key query
    QueryDeviceKeys,
    /// One-time key claim
    ClaimOneTimeKeys,
    /// Outbound pairwise session setup
    CreatePairwiseSession,
    /// Encrypting a room key for one device
    EncryptRoomKey,
    /// Sending a to-device batch
    SendToDevice,
    /// Encrypting a room event under the group session
    EncryptRoomEvent,
    /// Sending a room event
    SendRoomEvent,
    /// Serializing a payload
    EncodePayload,
    /// Publishing device and one-time keys
    UploadKeys,
}

impl Operation {
    /// Snake-case name used in logs and error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Register => "register",
            Self::Logout => "logout",
            Self::JoinRoom => "join_room",
            Self::ResolveMembers => "resolve_members",
            Self::QueryDeviceKeys => "query_device_keys",
            Self::ClaimOneTimeKeys => "claim_one_time_keys",
            Self::CreatePairwiseSession => "create_pairwise_session",
            Self::EncryptRoomKey => "encrypt_room_key",
            Self::SendToDevice => "send_to_device",
            Self::EncryptRoomEvent => "encrypt_room_event",
            Self::SendRoomEvent => "send_room_event",
            Self::EncodePayload => "encode_payload",
            Self::UploadKeys => "upload_keys",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity store failures. All of them are fatal for the agent.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// No identity document exists at the path.
    #[error("no identity at {}", path.display())]
    NotFound {
        /// Document path
        path: PathBuf,
    },

    /// Reading or writing the document failed.
    #[error("identity I/O on {}: {source}", path.display())]
    Io {
        /// Document path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The document is not a valid identity.
    #[error("corrupt identity at {}: {reason}", path.display())]
    Corrupt {
        /// Document path
        path: PathBuf,
        /// Parser message
        reason: String,
    },

    /// The account could not be pickled or restored.
    #[error("identity account: {0}")]
    Crypto(#[from] CryptoError),
}

/// Failures surfaced by handshakes, sends and key publication.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Missing or rejected credentials.
    #[error("{operation}: authentication failed: {source}")]
    Authentication {
        /// Failed operation
        operation: Operation,
        /// Transport failure
        #[source]
        source: TransportError,
    },

    /// Membership, key query or key claim failed.
    #[error("{operation}: directory lookup failed: {source}")]
    Directory {
        /// Failed operation
        operation: Operation,
        /// Transport failure
        #[source]
        source: TransportError,
    },

    /// The cryptographic engine rejected an input.
    #[error("{operation}: encryption failed: {source}")]
    Encryption {
        /// Failed operation
        operation: Operation,
        /// Engine failure
        #[source]
        source: CryptoError,
    },

    /// A send or upload was not accepted.
    #[error("{operation}: transport failed: {source}")]
    Transport {
        /// Failed operation
        operation: Operation,
        /// Transport failure
        #[source]
        source: TransportError,
    },

    /// A payload could not be built or a server response was malformed.
    #[error("{operation}: protocol error: {source}")]
    Protocol {
        /// Failed operation
        operation: Operation,
        /// Protocol failure
        #[source]
        source: ProtocolError,
    },

    /// The local identity could not be persisted.
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

impl SessionError {
    /// Map a directory-call failure, lifting credential errors.
    pub fn directory(operation: Operation) -> impl FnOnce(TransportError) -> Self {
        move |source| {
            if source.is_authentication() {
                Self::Authentication { operation, source }
            } else {
                Self::Directory { operation, source }
            }
        }
    }

    /// Map a send or upload failure, lifting credential errors.
    pub fn transport(operation: Operation) -> impl FnOnce(TransportError) -> Self {
        move |source| {
            if source.is_authentication() {
                Self::Authentication { operation, source }
            } else {
                Self::Transport { operation, source }
            }
        }
    }

    /// Map an engine failure.
    pub fn encryption(operation: Operation) -> impl FnOnce(CryptoError) -> Self {
        move |source| Self::Encryption { operation, source }
    }

    /// Map a protocol failure.
    pub fn protocol(operation: Operation) -> impl FnOnce(ProtocolError) -> Self {
        move |source| Self::Protocol { operation, source }
    }

    /// Operation the error is attributed to, if any.
    pub fn operation(&self) -> Option<Operation> {
        match self {
            Self::Authentication { operation, .. }
            | Self::Directory { operation, .. }
            | Self::Encryption { operation, .. }
            | Self::Transport { operation, .. }
            | Self::Protocol { operation, .. } => Some(*operation),
            Self::Identity(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_directory_call_is_authentication() {
        let err = SessionError::directory(Operation::QueryDeviceKeys)(TransportError::MissingToken);

        assert!(matches!(
            err,
            SessionError::Authentication { operation: Operation::QueryDeviceKeys, .. }
        ));
    }

    #[test]
    fn server_error_on_claim_is_directory() {
        let err = SessionError::directory(Operation::ClaimOneTimeKeys)(TransportError::Status {
            status: 502,
            message: "bad gateway".into(),
        });

        assert!(matches!(err, SessionError::Directory { .. }));
        assert_eq!(err.operation(), Some(Operation::ClaimOneTimeKeys));
    }

    #[test]
    fn message_names_operation() {
        let err = SessionError::transport(Operation::SendToDevice)(TransportError::Network(
            "connection reset".into(),
        ));

        assert_eq!(
            err.to_string(),
            "send_to_device: transport failed: network error: connection reset"
        );
    }
}
