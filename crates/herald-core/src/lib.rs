//! Herald Core
//!
//! Encrypted-session orchestration for a Matrix client agent: the layer that
//! decides which devices need a room's group session key, gets it to them over
//! pairwise sessions, and keeps the bookkeeping that makes repeat sends cheap.
//!
//! # Architecture
//!
//! ```text
//! IdentityStore ──► KeyPublisher ──► Transport (keys/upload)
//!       │
//!       ▼
//! GroupSessionManager (room id → RoomState { OutboundGroup, ShakenSet })
//!       │
//!       ▼
//! PairwiseSessionManager ──► DeviceDirectory ──► Transport (members, keys/query, keys/claim)
//!       │
//!       └──► key delivery ──► Transport (sendToDevice)
//! ```
//!
//! The cryptographic engine ([`herald_crypto::CryptoEngine`]), the transport
//! ([`Transport`]) and the source of randomness ([`Environment`]) are all
//! injected, so the whole layer runs against deterministic doubles in tests.
//!
//! # Concurrency
//!
//! Room state is serialized per room: a send holds its room's lock for the
//! whole handshake, encryption and transmission. Different rooms never
//! contend.

#![forbid(unsafe_code)]

pub mod directory;
pub mod env;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod publish;
pub mod room;
pub mod system_env;
pub mod transport;

pub use directory::{Device, DeviceDirectory};
pub use env::Environment;
pub use error::{IdentityError, Operation, SessionError};
pub use handshake::{
    HandshakeReport, HandshakeStage, KeyDelivery, PairwiseSession, PairwiseSessionManager,
    pending_devices,
};
pub use identity::{DEFAULT_ONE_TIME_KEYS, Identity, IdentityStore};
pub use publish::{KeyPublisher, PublishReport, signed_device_keys, signed_one_time_keys};
pub use room::{
    GroupSessionInfo, GroupSessionManager, OutboundGroup, RoomGuard, RoomState, ShakenSet,
};
pub use system_env::SystemEnv;
pub use transport::{Credentials, Transport, TransportError};
