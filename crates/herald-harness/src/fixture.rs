//! Ready-made world for end-to-end tests: one agent account, one room,
//! any number of remote devices.

use std::{path::Path, sync::Arc};

use herald_client::{ClientConfig, ClientError, Messenger};
use herald_proto::{DeviceId, ProtocolError, RoomId, UserId};
use tempfile::TempDir;

use crate::{mock_engine::MockEngine, peer::SimPeer, sim_env::SimEnv, sim_homeserver::SimHomeserver};

/// The agent's user id.
pub const AGENT_USER: &str = "@herald:sim";

/// The agent's password.
pub const AGENT_PASSWORD: &str = "hunter2";

/// Device id the server assigns to the agent's login.
pub const AGENT_DEVICE: &str = "HERALD";

/// One-time keys the agent keeps on the server.
pub const AGENT_ONE_TIME_KEYS: usize = 10;

/// The agent's messenger over the simulated stack.
pub type SimMessenger = Messenger<MockEngine, SimHomeserver, SimEnv>;

/// Agent account, shared room and scratch directory.
pub struct Fixture {
    /// Engine shared by the agent and every peer
    pub engine: Arc<MockEngine>,
    /// The homeserver
    pub server: Arc<SimHomeserver>,
    /// Seeded environment
    pub env: SimEnv,
    /// Agent configuration, identity inside [`Fixture::dir`]
    pub config: ClientConfig,
    /// Room every peer joins
    pub room_id: RoomId,
    dir: TempDir,
}

impl Fixture {
    /// World seeded with `seed`. The agent account exists but is not logged
    /// in yet.
    pub fn new(seed: u64) -> std::io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let server = Arc::new(SimHomeserver::new());
        server.add_account(UserId::new(AGENT_USER), AGENT_PASSWORD, DeviceId::new(AGENT_DEVICE));

        let config = ClientConfig {
            one_time_keys: AGENT_ONE_TIME_KEYS,
            identity_path: dir.path().join("identity.json"),
        };

        Ok(Self {
            engine: Arc::new(MockEngine::new(seed)),
            server,
            env: SimEnv::with_seed(seed),
            config,
            room_id: RoomId::new("!ops:sim"),
            dir,
        })
    }

    /// Scratch directory holding the agent's files.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Publish a remote device holding `one_time_keys` claimable keys and
    /// add its user to the room.
    pub fn peer(&self, user: &str, device: &str, one_time_keys: usize) -> Result<SimPeer, ProtocolError> {
        let mut peer = SimPeer::new(&self.engine, UserId::new(user), DeviceId::new(device));
        peer.enroll(&self.engine, &self.server, &self.room_id, one_time_keys)?;

        tracing::debug!(user, device, one_time_keys, "enrolled peer device");
        Ok(peer)
    }

    /// Log the agent in, creating and publishing its identity.
    pub async fn login(&self) -> Result<SimMessenger, ClientError> {
        Messenger::login(
            Arc::clone(&self.engine),
            Arc::clone(&self.server),
            self.env.clone(),
            &self.config,
            AGENT_USER,
            AGENT_PASSWORD,
        )
        .await
    }
}
