//! Property tests over arbitrary rooms.
//!
//! For any mix of peer devices with and without one-time keys, a send must
//! hand the key to exactly the devices that had one, and the standard
//! invariants must hold.

use herald_harness::{Fixture, InvariantRegistry, Snapshot};
use proptest::prelude::*;

fn run(seed: u64, devices: &[bool], sends: usize) -> Result<(), TestCaseError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .map_err(|e| TestCaseError::fail(e.to_string()))?;

    runtime.block_on(async {
        let fixture = Fixture::new(seed).unwrap();
        let mut peers = Vec::new();
        for (i, has_key) in devices.iter().enumerate() {
            let user = format!("@peer{}:sim", i % 2);
            let keys = if *has_key { sends } else { 0 };
            peers.push((fixture.peer(&user, &format!("DEV{i}"), keys).unwrap(), *has_key));
        }
        let messenger = fixture.login().await.unwrap();

        for n in 0..sends {
            messenger.send_encrypted(&fixture.room_id, &format!("message {n}")).await.unwrap();
        }

        for (peer, has_key) in &peers {
            let shaken = messenger
                .group_sessions()
                .is_shaken(&fixture.room_id, peer.user_id(), peer.device_id())
                .await;
            prop_assert_eq!(shaken, *has_key);
        }

        let delivered: usize =
            fixture.server.to_device_batches().iter().map(|b| b.messages.device_count()).sum();
        prop_assert_eq!(delivered, devices.iter().filter(|k| **k).count());
        prop_assert_eq!(fixture.server.room_events().len(), sends);

        let snapshot =
            Snapshot::capture(&fixture.server, &messenger, &[fixture.room_id.clone()]).await;
        prop_assert!(InvariantRegistry::standard().check_all(&snapshot).is_ok());
        Ok(())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn each_device_with_a_key_is_handshaken_once(
        seed in any::<u64>(),
        devices in prop::collection::vec(any::<bool>(), 0..6),
        sends in 1usize..4,
    ) {
        run(seed, &devices, sends)?;
    }
}
