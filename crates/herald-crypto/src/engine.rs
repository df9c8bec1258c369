//! The cryptographic engine trait.

use crate::{
    error::CryptoError,
    keys::{Curve25519Key, IdentityKeys, OlmCiphertext, OneTimeKey, Signature},
};

/// Cryptographic primitives consumed by the session orchestration layer.
///
/// Accounts and sessions are owned by the caller and passed back into the
/// engine for every operation, so the engine itself holds no per-room or
/// per-peer state.
///
/// # Invariants
///
/// Implementations MUST guarantee:
///
/// - `one_time_keys()` never lists a key after `mark_keys_as_published()`
///   covered it
/// - `group_session_id()` is stable for the lifetime of a group session
/// - `unpickle_account(pickle_account(a))` restores an account with the same
///   identity keys and the same unpublished one-time keys
pub trait CryptoEngine: Send + Sync + 'static {
    /// Long-term account: identity key pairs and one-time key pool.
    type Account: Send + Sync;

    /// Outbound pairwise session to one remote device.
    type PairwiseSession: Send;

    /// Outbound group session for one room.
    type GroupSession: Send;

    /// Create a fresh account with new identity keys and an empty key pool.
    fn create_account(&self) -> Self::Account;

    /// Add `count` one-time keys to the account's unpublished pool.
    fn generate_one_time_keys(&self, account: &mut Self::Account, count: usize);

    /// Public identity keys of the account.
    fn identity_keys(&self, account: &Self::Account) -> IdentityKeys;

    /// One-time keys generated but not yet marked as published.
    fn one_time_keys(&self, account: &Self::Account) -> Vec<OneTimeKey>;

    /// Sign `message` with the account's ed25519 key.
    fn sign(&self, account: &Self::Account, message: &str) -> Signature;

    /// Mark every listed one-time key as published.
    fn mark_keys_as_published(&self, account: &mut Self::Account);

    /// Establish an outbound pairwise session with a remote device.
    ///
    /// Seeded with the peer's curve25519 identity key and one of its claimed
    /// one-time keys.
    fn create_outbound_session(
        &self,
        account: &Self::Account,
        identity_key: &Curve25519Key,
        one_time_key: &Curve25519Key,
    ) -> Result<Self::PairwiseSession, CryptoError>;

    /// Encrypt `plaintext` for the session's peer.
    fn encrypt_pairwise(
        &self,
        session: &mut Self::PairwiseSession,
        plaintext: &str,
    ) -> Result<OlmCiphertext, CryptoError>;

    /// Create a new outbound group session.
    fn create_group_session(&self) -> Self::GroupSession;

    /// Id of a group session.
    fn group_session_id(&self, session: &Self::GroupSession) -> String;

    /// Exportable key of a group session at its current ratchet index.
    fn group_session_key(&self, session: &Self::GroupSession) -> String;

    /// Encrypt `plaintext` under the group session, advancing its ratchet.
    fn encrypt_group(
        &self,
        session: &mut Self::GroupSession,
        plaintext: &str,
    ) -> Result<String, CryptoError>;

    /// Serialize the account for durable storage.
    fn pickle_account(&self, account: &Self::Account) -> Result<String, CryptoError>;

    /// Restore an account serialized by [`CryptoEngine::pickle_account`].
    fn unpickle_account(&self, pickle: &str) -> Result<Self::Account, CryptoError>;
}
