//! Deterministic cryptographic engine for tests.
//!
//! Mirrors the shape of Olm/Megolm closely enough for the orchestration
//! layer, and lets tests play the receiving side: pairwise and group
//! ciphertexts can be decrypted from public material alone.
//!
//! # Security
//!
//! None. Pairwise keys are derived from public keys only. Never use this
//! engine outside tests.
//!
//! # Construction
//!
//! - Key material: SHA-256 over `(seed, counter)`, so a given seed yields the
//!   same accounts and sessions every run
//! - Pairwise: HKDF-SHA256 over `sender_curve || recipient_curve ||
//!   one_time_key`, `ChaCha20-Poly1305` with a per-message counter nonce
//! - Group: HKDF-SHA256 per ratchet index, `ChaCha20-Poly1305`

use std::sync::atomic::{AtomicU64, Ordering};

use base64::{Engine as _, engine::general_purpose::STANDARD_NO_PAD};
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit},
};
use herald_crypto::{
    CryptoEngine, CryptoError, Curve25519Key, Ed25519Key, IdentityKeys, OlmCiphertext, OneTimeKey,
    Signature,
};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const PAIRWISE_SALT: &[u8] = b"herald-mock-olm";
const GROUP_SALT: &[u8] = b"herald-mock-megolm";

/// Mock engine. Cheap to share; all state lives in accounts and sessions.
pub struct MockEngine {
    seed: u64,
    counter: AtomicU64,
}

/// Account of the mock engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockAccount {
    identity_secret: [u8; 32],
    next_key_id: u32,
    unpublished: Vec<MockOneTimeKey>,
    published: Vec<MockOneTimeKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MockOneTimeKey {
    id: u32,
    secret: [u8; 32],
}

/// Outbound pairwise session of the mock engine.
pub struct MockPairwiseSession {
    key: [u8; 32],
    sent: u32,
}

/// Outbound group session of the mock engine.
pub struct MockGroupSession {
    key: [u8; 32],
    index: u32,
}

fn hash(label: &[u8], data: &[u8]) -> [u8; 32] {
    Sha256::new().chain_update(label).chain_update(data).finalize().into()
}

fn encode(bytes: &[u8]) -> String {
    STANDARD_NO_PAD.encode(bytes)
}

fn decode(kind: &'static str, raw: &str) -> Result<Vec<u8>, CryptoError> {
    STANDARD_NO_PAD
        .decode(raw)
        .map_err(|e| CryptoError::InvalidKey { kind, reason: e.to_string() })
}

fn decode_key(kind: &'static str, raw: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = decode(kind, raw)?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| CryptoError::InvalidKey {
        kind,
        reason: format!("expected 32 bytes, got {}", bytes.len()),
    })
}

fn derive(salt: &[u8], ikm: &[u8], info: &[u8]) -> [u8; 32] {
    let mut okm = [0u8; 32];
    let Ok(()) = Hkdf::<Sha256>::new(Some(salt), ikm).expand(info, &mut okm) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    okm
}

fn seal(key: &[u8; 32], counter: u32, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; 12];
    nonce[8..].copy_from_slice(&counter.to_be_bytes());

    let ciphertext = ChaCha20Poly1305::new(key.into())
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| CryptoError::EncryptionFailed { reason: e.to_string() })?;

    let mut out = counter.to_be_bytes().to_vec();
    out.extend(ciphertext);
    Ok(out)
}

fn open(key: &[u8; 32], sealed: &[u8]) -> Result<(u32, String), CryptoError> {
    let failed = |reason: &str| CryptoError::EncryptionFailed { reason: reason.to_string() };
    if sealed.len() < 4 {
        return Err(failed("ciphertext too short"));
    }

    let (counter, ciphertext) = sealed.split_at(4);
    let counter = u32::from_be_bytes([counter[0], counter[1], counter[2], counter[3]]);
    let mut nonce = [0u8; 12];
    nonce[8..].copy_from_slice(&counter.to_be_bytes());

    let plaintext = ChaCha20Poly1305::new(key.into())
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| failed("authentication failed"))?;
    let plaintext = String::from_utf8(plaintext).map_err(|_| failed("plaintext is not UTF-8"))?;

    Ok((counter, plaintext))
}

fn curve25519_of(secret: &[u8; 32]) -> Curve25519Key {
    Curve25519Key::new(encode(&hash(b"curve25519", secret)))
}

fn ed25519_of(secret: &[u8; 32]) -> Ed25519Key {
    Ed25519Key::new(encode(&hash(b"ed25519", secret)))
}

fn one_time_key_of(secret: &[u8; 32]) -> Curve25519Key {
    Curve25519Key::new(encode(&hash(b"one-time", secret)))
}

fn pairwise_key(sender: &[u8; 32], recipient: &[u8; 32], one_time_key: &[u8; 32]) -> [u8; 32] {
    let mut ikm = Vec::with_capacity(96);
    ikm.extend_from_slice(sender);
    ikm.extend_from_slice(recipient);
    ikm.extend_from_slice(one_time_key);
    derive(PAIRWISE_SALT, &ikm, b"pairwise")
}

fn group_message_key(key: &[u8; 32], index: u32) -> [u8; 32] {
    derive(GROUP_SALT, key, &index.to_be_bytes())
}

impl MockEngine {
    /// Engine whose key material is derived from `seed`.
    pub fn new(seed: u64) -> Self {
        Self { seed, counter: AtomicU64::new(0) }
    }

    fn fresh_secret(&self) -> [u8; 32] {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut input = self.seed.to_be_bytes().to_vec();
        input.extend_from_slice(&n.to_be_bytes());
        hash(b"secret", &input)
    }

    /// Whether `signature` is `signer`'s signature over `message`.
    pub fn verify(signer: &Ed25519Key, message: &str, signature: &Signature) -> bool {
        let expected = hash(signer.as_str().as_bytes(), message.as_bytes());
        encode(&expected) == signature.as_str()
    }

    /// Decrypt a pairwise ciphertext as the recipient.
    ///
    /// `one_time_key` is the recipient's key the sender claimed.
    pub fn decrypt_pairwise(
        sender_key: &Curve25519Key,
        recipient_key: &Curve25519Key,
        one_time_key: &Curve25519Key,
        body: &str,
    ) -> Result<String, CryptoError> {
        let key = pairwise_key(
            &decode_key("curve25519 identity", sender_key.as_str())?,
            &decode_key("curve25519 identity", recipient_key.as_str())?,
            &decode_key("curve25519 one-time", one_time_key.as_str())?,
        );
        let (_, plaintext) = open(&key, &decode("ciphertext", body)?)?;
        Ok(plaintext)
    }

    /// Decrypt a group ciphertext with a shared session key.
    ///
    /// Fails for messages encrypted before the key's ratchet index.
    pub fn decrypt_group(session_key: &str, ciphertext: &str) -> Result<String, CryptoError> {
        let exported = decode("session", session_key)?;
        if exported.len() != 36 {
            return Err(CryptoError::InvalidKey {
                kind: "session",
                reason: format!("expected 36 bytes, got {}", exported.len()),
            });
        }
        let first_index = u32::from_be_bytes([exported[0], exported[1], exported[2], exported[3]]);
        let mut key = [0u8; 32];
        key.copy_from_slice(&exported[4..]);

        let sealed = decode("ciphertext", ciphertext)?;
        let index = sealed
            .get(..4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| CryptoError::EncryptionFailed { reason: "ciphertext too short".into() })?;
        if index < first_index {
            return Err(CryptoError::EncryptionFailed {
                reason: format!("message index {index} precedes shared index {first_index}"),
            });
        }

        let (_, plaintext) = open(&group_message_key(&key, index), &sealed)?;
        Ok(plaintext)
    }

    /// One-time keys of `account` including published ones, as the
    /// directory would hand them out.
    pub fn all_one_time_keys(account: &MockAccount) -> Vec<OneTimeKey> {
        account
            .published
            .iter()
            .chain(&account.unpublished)
            .map(|k| OneTimeKey { id: key_id(k.id), key: one_time_key_of(&k.secret) })
            .collect()
    }
}

fn key_id(id: u32) -> String {
    encode(&id.to_be_bytes())
}

impl CryptoEngine for MockEngine {
    type Account = MockAccount;
    type PairwiseSession = MockPairwiseSession;
    type GroupSession = MockGroupSession;

    fn create_account(&self) -> MockAccount {
        MockAccount {
            identity_secret: self.fresh_secret(),
            next_key_id: 1,
            unpublished: Vec::new(),
            published: Vec::new(),
        }
    }

    fn generate_one_time_keys(&self, account: &mut MockAccount, count: usize) {
        for _ in 0..count {
            let id = account.next_key_id;
            account.next_key_id += 1;
            account.unpublished.push(MockOneTimeKey { id, secret: self.fresh_secret() });
        }
    }

    fn identity_keys(&self, account: &MockAccount) -> IdentityKeys {
        IdentityKeys {
            curve25519: curve25519_of(&account.identity_secret),
            ed25519: ed25519_of(&account.identity_secret),
        }
    }

    fn one_time_keys(&self, account: &MockAccount) -> Vec<OneTimeKey> {
        account
            .unpublished
            .iter()
            .map(|k| OneTimeKey { id: key_id(k.id), key: one_time_key_of(&k.secret) })
            .collect()
    }

    fn sign(&self, account: &MockAccount, message: &str) -> Signature {
        let signer = ed25519_of(&account.identity_secret);
        Signature::new(encode(&hash(signer.as_str().as_bytes(), message.as_bytes())))
    }

    fn mark_keys_as_published(&self, account: &mut MockAccount) {
        let published = std::mem::take(&mut account.unpublished);
        account.published.extend(published);
    }

    fn create_outbound_session(
        &self,
        account: &MockAccount,
        identity_key: &Curve25519Key,
        one_time_key: &Curve25519Key,
    ) -> Result<MockPairwiseSession, CryptoError> {
        let sender = decode_key("curve25519 identity", curve25519_of(&account.identity_secret).as_str())?;
        let recipient = decode_key("curve25519 identity", identity_key.as_str())?;
        let one_time_key = decode_key("curve25519 one-time", one_time_key.as_str())?;

        Ok(MockPairwiseSession { key: pairwise_key(&sender, &recipient, &one_time_key), sent: 0 })
    }

    fn encrypt_pairwise(
        &self,
        session: &mut MockPairwiseSession,
        plaintext: &str,
    ) -> Result<OlmCiphertext, CryptoError> {
        let sealed = seal(&session.key, session.sent, plaintext.as_bytes())?;
        session.sent += 1;

        // Outbound-only sessions never see a reply, so every message is a
        // pre-key message.
        Ok(OlmCiphertext { message_type: OlmCiphertext::PRE_KEY, body: encode(&sealed) })
    }

    fn create_group_session(&self) -> MockGroupSession {
        MockGroupSession { key: self.fresh_secret(), index: 0 }
    }

    fn group_session_id(&self, session: &MockGroupSession) -> String {
        encode(&hash(b"session-id", &session.key))
    }

    fn group_session_key(&self, session: &MockGroupSession) -> String {
        let mut exported = session.index.to_be_bytes().to_vec();
        exported.extend_from_slice(&session.key);
        encode(&exported)
    }

    fn encrypt_group(
        &self,
        session: &mut MockGroupSession,
        plaintext: &str,
    ) -> Result<String, CryptoError> {
        let message_key = group_message_key(&session.key, session.index);
        let sealed = seal(&message_key, session.index, plaintext.as_bytes())?;
        session.index += 1;

        Ok(encode(&sealed))
    }

    fn pickle_account(&self, account: &MockAccount) -> Result<String, CryptoError> {
        serde_json::to_string(account).map_err(|e| CryptoError::Pickle { reason: e.to_string() })
    }

    fn unpickle_account(&self, pickle: &str) -> Result<MockAccount, CryptoError> {
        serde_json::from_str(pickle).map_err(|e| CryptoError::Pickle { reason: e.to_string() })
    }
}
