//! Deterministic simulation harness for Herald.
//!
//! In-memory implementations of the Environment, Transport and crypto
//! engine seams, so the whole send pipeline runs reproducibly inside a unit
//! test:
//!
//! - [`SimEnv`]: seeded randomness, so transaction ids repeat across runs
//! - [`MockEngine`]: deterministic engine whose ciphertexts tests can open
//! - [`SimHomeserver`]: server state plus a log of every call, with
//!   one-shot failure injection per endpoint
//! - [`SimPeer`]: a remote device that receives keys and decrypts events
//!
//! # Invariant Testing
//!
//! The `invariants` module checks properties of a finished run (unique
//! transaction ids, no self delivery, shaken devices were delivered to)
//! independent of the scenario that produced it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fixture;
pub mod invariants;
pub mod mock_engine;
pub mod peer;
pub mod sim_env;
pub mod sim_homeserver;

pub use fixture::{
    AGENT_DEVICE, AGENT_ONE_TIME_KEYS, AGENT_PASSWORD, AGENT_USER, Fixture, SimMessenger,
};
pub use invariants::{
    Invariant, InvariantRegistry, InvariantResult, NoSelfDelivery, SendsTargetJoinedRooms,
    ShakenImpliesDelivered, Snapshot, UniqueTransactionIds, Violation,
};
pub use mock_engine::{MockAccount, MockEngine, MockGroupSession, MockPairwiseSession};
pub use peer::{PeerError, SimPeer};
pub use sim_env::SimEnv;
pub use sim_homeserver::{Endpoint, Gate, RoomEvent, SimHomeserver, ToDeviceBatch};
