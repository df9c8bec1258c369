//! Identity documents on disk.

use std::{fs, sync::Arc};

use herald_core::{IdentityError, IdentityStore};
use herald_crypto::CryptoEngine;
use herald_harness::MockEngine;

fn store(one_time_keys: usize) -> (Arc<MockEngine>, IdentityStore<MockEngine>) {
    let engine = Arc::new(MockEngine::new(40));
    let store = IdentityStore::new(Arc::clone(&engine), one_time_keys);
    (engine, store)
}

#[test]
fn missing_identity_is_created_with_configured_key_pool() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("identity.json");
    let (engine, store) = store(7);

    let identity = store.load_or_create(&path).unwrap();

    assert!(path.exists());
    assert_eq!(engine.one_time_keys(identity.account()).len(), 7);
    assert!(!path.with_file_name("identity.json.tmp").exists());
}

#[test]
fn existing_identity_is_restored_not_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("identity.json");
    let (engine, store) = store(5);

    let created = store.load_or_create(&path).unwrap();
    let restored = store.load_or_create(&path).unwrap();

    assert_eq!(restored.keys(), created.keys());
    assert_eq!(
        engine.one_time_keys(restored.account()),
        engine.one_time_keys(created.account())
    );
}

#[test]
fn load_distinguishes_missing_from_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("identity.json");
    let (_, store) = store(5);

    assert!(matches!(store.load(&path), Err(IdentityError::NotFound { .. })));

    fs::write(&path, "{not json").unwrap();
    assert!(matches!(store.load(&path), Err(IdentityError::Corrupt { .. })));
    assert!(matches!(store.load_or_create(&path), Err(IdentityError::Corrupt { .. })));
}

#[test]
fn persist_replaces_the_previous_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("identity.json");
    let (_, store) = store(2);

    let first = store.load_or_create(&path).unwrap();
    let second = store.create();
    store.persist(&second, &path).unwrap();

    let loaded = store.load(&path).unwrap();
    assert_eq!(loaded.keys(), second.keys());
    assert_ne!(loaded.keys(), first.keys());
}
