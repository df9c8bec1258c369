//! Registration, login, key publication and logout.

use std::sync::Arc;

use herald_client::{ClientError, Messenger, SessionFile};
use herald_core::{Credentials, IdentityStore, Operation, SessionError, TransportError};
use herald_crypto::{CryptoEngine, Signature};
use herald_harness::{
    AGENT_DEVICE, AGENT_ONE_TIME_KEYS, AGENT_PASSWORD, AGENT_USER, Endpoint, Fixture, MockEngine,
    SimHomeserver,
};
use herald_proto::{DeviceId, KeyAlgorithm, RoomId, UserId, to_canonical_json};

#[tokio::test]
async fn login_publishes_signed_keys() {
    let fixture = Fixture::new(20).unwrap();
    let messenger = fixture.login().await.unwrap();
    let keys = messenger.identity_keys().await;

    let uploads = fixture.server.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].one_time_keys.len(), AGENT_ONE_TIME_KEYS);

    let mut device_keys = uploads[0].device_keys.clone().unwrap();
    assert_eq!(device_keys.device_id.as_str(), AGENT_DEVICE);
    assert_eq!(device_keys.key(KeyAlgorithm::Curve25519), Some(keys.curve25519.as_str()));
    assert_eq!(device_keys.key(KeyAlgorithm::Ed25519), Some(keys.ed25519.as_str()));

    let signature =
        device_keys.signatures[&UserId::new(AGENT_USER)][&format!("ed25519:{AGENT_DEVICE}")].clone();
    device_keys.signatures.clear();
    assert!(MockEngine::verify(
        &keys.ed25519,
        &to_canonical_json(&device_keys).unwrap(),
        &Signature::new(signature),
    ));

    for (key_id, key) in &uploads[0].one_time_keys {
        assert!(key_id.starts_with("signed_curve25519:"));
        let mut unsigned = key.clone();
        let signature =
            unsigned.signatures[&UserId::new(AGENT_USER)][&format!("ed25519:{AGENT_DEVICE}")].clone();
        unsigned.signatures.clear();
        assert!(MockEngine::verify(
            &keys.ed25519,
            &to_canonical_json(&unsigned).unwrap(),
            &Signature::new(signature),
        ));
    }
}

#[tokio::test]
async fn publication_tops_up_a_drained_supply() {
    let fixture = Fixture::new(21).unwrap();
    let messenger = fixture.login().await.unwrap();
    let user = UserId::new(AGENT_USER);
    let device = DeviceId::new(AGENT_DEVICE);

    fixture.server.drain_one_time_keys(&user, &device);
    let report = messenger.publish_keys().await.unwrap();

    assert_eq!(report.uploaded, AGENT_ONE_TIME_KEYS);
    assert_eq!(report.server_count, AGENT_ONE_TIME_KEYS as u64);
    assert_eq!(fixture.server.one_time_key_count(&user, &device), AGENT_ONE_TIME_KEYS as u64);

    // Device keys again, then the refill.
    let uploads = fixture.server.uploads();
    assert_eq!(uploads.len(), 3);
    assert!(uploads[1].one_time_keys.is_empty());
    assert!(uploads[2].device_keys.is_none());
}

#[tokio::test]
async fn publication_leaves_a_healthy_supply_alone() {
    let fixture = Fixture::new(22).unwrap();
    let messenger = fixture.login().await.unwrap();

    let report = messenger.publish_keys().await.unwrap();

    assert_eq!(report.uploaded, 0);
    assert_eq!(report.server_count, AGENT_ONE_TIME_KEYS as u64);
    assert_eq!(fixture.server.uploads().len(), 2);
}

#[tokio::test]
async fn login_persists_the_published_identity() {
    let fixture = Fixture::new(23).unwrap();
    let messenger = fixture.login().await.unwrap();
    let published = messenger.identity_keys().await;

    let store = IdentityStore::new(Arc::clone(&fixture.engine), AGENT_ONE_TIME_KEYS);
    let identity = store.load(&fixture.config.identity_path).unwrap();

    assert_eq!(identity.keys(), &published);
    assert!(fixture.engine.one_time_keys(identity.account()).is_empty());

    let reopened = Messenger::open(
        Arc::clone(&fixture.engine),
        Arc::clone(&fixture.server),
        fixture.env.clone(),
        messenger.credentials().clone(),
        &fixture.config,
    )
    .unwrap();
    assert_eq!(reopened.identity_keys().await, published);
}

#[tokio::test]
async fn wrong_password_is_an_authentication_error() {
    let fixture = Fixture::new(24).unwrap();

    let result = Messenger::login(
        Arc::clone(&fixture.engine),
        Arc::clone(&fixture.server),
        fixture.env.clone(),
        &fixture.config,
        AGENT_USER,
        "wrong",
    )
    .await;

    let Err(ClientError::Session(error)) = result else {
        panic!("login with a wrong password succeeded");
    };
    assert!(matches!(error, SessionError::Authentication { operation: Operation::Login, .. }));
    assert!(!fixture.config.identity_path.exists());
}

#[tokio::test]
async fn registration_answers_the_dummy_stage() {
    let fixture = Fixture::new(25).unwrap();
    fixture.server.require_auth_stage();

    let messenger = Messenger::register(
        Arc::clone(&fixture.engine),
        Arc::clone(&fixture.server),
        fixture.env.clone(),
        &fixture.config,
        "@newcomer:sim",
        AGENT_PASSWORD,
    )
    .await
    .unwrap();

    assert_eq!(fixture.server.count(Endpoint::Register), 2);
    assert_eq!(messenger.credentials().user_id.as_str(), "@newcomer:sim");
    assert_eq!(fixture.server.uploads().len(), 1);
    assert!(fixture.config.identity_path.exists());
}

#[tokio::test]
async fn missing_token_surfaces_as_authentication() {
    let fixture = Fixture::new(26).unwrap();
    let credentials = Credentials {
        user_id: UserId::new(AGENT_USER),
        device_id: DeviceId::new(AGENT_DEVICE),
        access_token: String::new(),
    };
    let messenger = Messenger::open(
        Arc::clone(&fixture.engine),
        Arc::new(SimHomeserver::new()),
        fixture.env.clone(),
        credentials,
        &fixture.config,
    )
    .unwrap();

    let error = messenger.send_encrypted(&RoomId::new("!r:sim"), "hi").await.unwrap_err();

    let SessionError::Authentication { operation, source } = error else {
        panic!("expected an authentication error");
    };
    assert_eq!(operation, Operation::JoinRoom);
    assert_eq!(source, TransportError::MissingToken);
}

#[tokio::test]
async fn plain_send_joins_once_and_carries_both_bodies() {
    let fixture = Fixture::new(27).unwrap();
    let messenger = fixture.login().await.unwrap();

    messenger.send(&fixture.room_id, "<p>build <b>green</b></p>").await.unwrap();
    messenger.send(&fixture.room_id, "again").await.unwrap();

    assert_eq!(fixture.server.count(Endpoint::JoinRoom), 1);

    let events = fixture.server.room_events();
    assert_eq!(events[0].event_type, "m.room.message");
    assert_eq!(events[0].content["msgtype"], "m.text");
    assert_eq!(events[0].content["body"], "build green");
    assert_eq!(events[0].content["format"], "org.matrix.custom.html");
    assert_eq!(events[0].content["formatted_body"], "<p>build <b>green</b></p>");
    assert_ne!(events[0].txn_id, events[1].txn_id);
}

#[tokio::test]
async fn logout_invalidates_the_session() {
    let fixture = Fixture::new(28).unwrap();
    let messenger = fixture.login().await.unwrap();

    messenger.logout().await.unwrap();

    let error = messenger.send(&fixture.room_id, "after logout").await.unwrap_err();
    assert!(matches!(error, SessionError::Authentication { .. }));
}

#[tokio::test]
async fn logout_needs_no_identity_and_removes_it() {
    let fixture = Fixture::new(29).unwrap();
    let messenger = fixture.login().await.unwrap();
    let session_path = fixture.dir().join("config.json");
    SessionFile {
        server: "sim".into(),
        credentials: messenger.credentials().clone(),
        pickle_key: String::new(),
    }
    .save(&session_path)
    .unwrap();
    drop(messenger);

    std::fs::remove_file(&fixture.config.identity_path).unwrap();
    herald_client::logout(&*fixture.server, true).await.unwrap();
    assert!(!fixture.config.identity_path.exists());
    assert_eq!(fixture.server.count(Endpoint::LogoutAll), 1);

    std::fs::write(&fixture.config.identity_path, "{}").unwrap();
    SessionFile::remove(&session_path).unwrap();
    assert!(!session_path.exists());
    assert!(!fixture.config.identity_path.exists());
}
