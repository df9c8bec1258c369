//! Key publication: uploading signed device and one-time keys.
//!
//! Peers can only start a pairwise session with this device after its
//! identity keys and a supply of one-time keys are in the directory. Every
//! upload is followed by marking the keys published and persisting the
//! identity, in that order.

use std::{collections::BTreeMap, path::Path, sync::Arc};

use herald_crypto::CryptoEngine;
use herald_proto::{
    DeviceKeys, KeyAlgorithm, KeyId, MEGOLM_ALGORITHM, OLM_ALGORITHM, ProtocolError,
    SignedOneTimeKey, Signatures, to_canonical_json,
    keys::KeysUploadRequest,
};

use crate::{
    error::{Operation, SessionError},
    identity::{Identity, IdentityStore},
    transport::{Credentials, Transport},
};

/// Outcome of a publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    /// One-time keys uploaded
    pub uploaded: usize,
    /// Unclaimed `signed_curve25519` keys the server holds afterwards
    pub server_count: u64,
}

/// Signed identity keys of this device.
///
/// # Errors
///
/// Canonical encoding failed.
pub fn signed_device_keys<C: CryptoEngine>(
    engine: &C,
    identity: &Identity<C>,
    own: &Credentials,
) -> Result<DeviceKeys, ProtocolError> {
    let keys = identity.keys();
    let mut device_keys = DeviceKeys {
        user_id: own.user_id.clone(),
        device_id: own.device_id.clone(),
        algorithms: vec![OLM_ALGORITHM.to_string(), MEGOLM_ALGORITHM.to_string()],
        keys: BTreeMap::from([
            (
                KeyId::for_device(KeyAlgorithm::Curve25519, &own.device_id).to_string(),
                keys.curve25519.to_string(),
            ),
            (
                KeyId::for_device(KeyAlgorithm::Ed25519, &own.device_id).to_string(),
                keys.ed25519.to_string(),
            ),
        ]),
        signatures: Signatures::new(),
    };

    let signature = engine.sign(identity.account(), &to_canonical_json(&device_keys)?);
    device_keys.signatures = signatures(own, signature.as_str());
    Ok(device_keys)
}

/// Every unpublished one-time key, signed, by `signed_curve25519:<id>`.
///
/// # Errors
///
/// Canonical encoding failed.
pub fn signed_one_time_keys<C: CryptoEngine>(
    engine: &C,
    identity: &Identity<C>,
    own: &Credentials,
) -> Result<BTreeMap<String, SignedOneTimeKey>, ProtocolError> {
    let mut signed = BTreeMap::new();

    for one_time_key in engine.one_time_keys(identity.account()) {
        let mut key =
            SignedOneTimeKey { key: one_time_key.key.to_string(), signatures: Signatures::new() };
        let signature = engine.sign(identity.account(), &to_canonical_json(&key)?);
        key.signatures = signatures(own, signature.as_str());

        signed.insert(KeyId::new(KeyAlgorithm::SignedCurve25519, one_time_key.id).to_string(), key);
    }

    Ok(signed)
}

fn signatures(own: &Credentials, signature: &str) -> Signatures {
    let key_id = KeyId::for_device(KeyAlgorithm::Ed25519, &own.device_id).to_string();
    Signatures::from([(own.user_id.clone(), BTreeMap::from([(key_id, signature.to_string())]))])
}

/// Uploads keys and keeps the server's one-time key supply topped up.
pub struct KeyPublisher<C: CryptoEngine, T: Transport> {
    engine: Arc<C>,
    transport: Arc<T>,
}

impl<C: CryptoEngine, T: Transport> KeyPublisher<C, T> {
    /// Publisher over the given engine and transport.
    pub fn new(engine: Arc<C>, transport: Arc<T>) -> Self {
        Self { engine, transport }
    }

    /// Upload device keys and unpublished one-time keys.
    ///
    /// When the server then holds fewer than half of the store's configured
    /// pool, enough fresh keys are generated and uploaded to refill it. The
    /// identity is persisted after every upload.
    ///
    /// # Errors
    ///
    /// Upload, encoding or persistence failure.
    pub async fn publish(
        &self,
        identity: &mut Identity<C>,
        own: &Credentials,
        store: &IdentityStore<C>,
        path: &Path,
    ) -> Result<PublishReport, SessionError> {
        let device_keys = signed_device_keys(&*self.engine, identity, own)
            .map_err(SessionError::protocol(Operation::UploadKeys))?;
        let mut report = self.upload(identity, Some(device_keys), own, store, path).await?;

        let target = u64::try_from(store.one_time_keys()).unwrap_or(u64::MAX);
        if report.server_count < target / 2 {
            let missing = usize::try_from(target - report.server_count).unwrap_or(0);
            self.engine.generate_one_time_keys(identity.account_mut(), missing);

            let topped_up = self.upload(identity, None, own, store, path).await?;
            report.uploaded += topped_up.uploaded;
            report.server_count = topped_up.server_count;
        }

        tracing::info!(
            user_id = %own.user_id,
            device_id = %own.device_id,
            uploaded = report.uploaded,
            server_count = report.server_count,
            "published keys"
        );
        Ok(report)
    }

    async fn upload(
        &self,
        identity: &mut Identity<C>,
        device_keys: Option<DeviceKeys>,
        own: &Credentials,
        store: &IdentityStore<C>,
        path: &Path,
    ) -> Result<PublishReport, SessionError> {
        let one_time_keys = signed_one_time_keys(&*self.engine, identity, own)
            .map_err(SessionError::protocol(Operation::UploadKeys))?;
        let uploaded = one_time_keys.len();

        let request = KeysUploadRequest { device_keys, one_time_keys };
        let response = self
            .transport
            .upload_keys(&request)
            .await
            .map_err(SessionError::transport(Operation::UploadKeys))?;

        self.engine.mark_keys_as_published(identity.account_mut());
        store.persist(identity, path)?;

        let server_count = response
            .one_time_key_counts
            .get(KeyAlgorithm::SignedCurve25519.as_str())
            .copied()
            .unwrap_or(0);

        Ok(PublishReport { uploaded, server_count })
    }
}
