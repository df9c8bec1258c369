//! vodozemac-backed engine.
//!
//! Olm v1 pairwise sessions and Megolm v1 outbound group sessions, matching
//! the `m.olm.v1.curve25519-aes-sha2` and `m.megolm.v1.aes-sha2` algorithm
//! identifiers Herald puts on the wire.

use vodozemac::{
    Curve25519PublicKey,
    megolm::{GroupSession, SessionConfig as MegolmSessionConfig},
    olm::{Account, AccountPickle, Session, SessionConfig},
};
use zeroize::Zeroizing;

use crate::{
    engine::CryptoEngine,
    error::CryptoError,
    keys::{Curve25519Key, Ed25519Key, IdentityKeys, OlmCiphertext, OneTimeKey, Signature},
};

/// Size of the account pickle key in bytes.
pub const PICKLE_KEY_SIZE: usize = 32;

/// Production engine over vodozemac.
///
/// Account pickles are encrypted with the engine's pickle key; restoring a
/// pickle requires an engine built with the same key.
pub struct OlmEngine {
    pickle_key: Zeroizing<[u8; PICKLE_KEY_SIZE]>,
}

impl OlmEngine {
    /// Engine whose pickles are encrypted with `pickle_key`.
    pub fn new(pickle_key: [u8; PICKLE_KEY_SIZE]) -> Self {
        Self { pickle_key: Zeroizing::new(pickle_key) }
    }
}

fn decode_curve25519(kind: &'static str, key: &Curve25519Key) -> Result<Curve25519PublicKey, CryptoError> {
    Curve25519PublicKey::from_base64(key.as_str())
        .map_err(|e| CryptoError::InvalidKey { kind, reason: e.to_string() })
}

impl CryptoEngine for OlmEngine {
    type Account = Account;
    type PairwiseSession = Session;
    type GroupSession = GroupSession;

    fn create_account(&self) -> Account {
        Account::new()
    }

    fn generate_one_time_keys(&self, account: &mut Account, count: usize) {
        let _ = account.generate_one_time_keys(count);
    }

    fn identity_keys(&self, account: &Account) -> IdentityKeys {
        let keys = account.identity_keys();
        IdentityKeys {
            curve25519: Curve25519Key::new(keys.curve25519.to_base64()),
            ed25519: Ed25519Key::new(keys.ed25519.to_base64()),
        }
    }

    fn one_time_keys(&self, account: &Account) -> Vec<OneTimeKey> {
        let mut keys: Vec<OneTimeKey> = account
            .one_time_keys()
            .into_iter()
            .map(|(id, key)| OneTimeKey { id: id.to_base64(), key: Curve25519Key::new(key.to_base64()) })
            .collect();
        keys.sort_by(|a, b| a.id.cmp(&b.id));
        keys
    }

    fn sign(&self, account: &Account, message: &str) -> Signature {
        Signature::new(account.sign(message).to_base64())
    }

    fn mark_keys_as_published(&self, account: &mut Account) {
        account.mark_keys_as_published();
    }

    fn create_outbound_session(
        &self,
        account: &Account,
        identity_key: &Curve25519Key,
        one_time_key: &Curve25519Key,
    ) -> Result<Session, CryptoError> {
        let identity_key = decode_curve25519("curve25519 identity", identity_key)?;
        let one_time_key = decode_curve25519("curve25519 one-time", one_time_key)?;

        Ok(account.create_outbound_session(SessionConfig::version_1(), identity_key, one_time_key))
    }

    fn encrypt_pairwise(
        &self,
        session: &mut Session,
        plaintext: &str,
    ) -> Result<OlmCiphertext, CryptoError> {
        let (message_type, body) = session.encrypt(plaintext).to_parts();
        let message_type = u8::try_from(message_type).map_err(|_| CryptoError::EncryptionFailed {
            reason: format!("unexpected olm message type {message_type}"),
        })?;

        Ok(OlmCiphertext { message_type, body: vodozemac::base64_encode(body) })
    }

    fn create_group_session(&self) -> GroupSession {
        GroupSession::new(MegolmSessionConfig::version_1())
    }

    fn group_session_id(&self, session: &GroupSession) -> String {
        session.session_id()
    }

    fn group_session_key(&self, session: &GroupSession) -> String {
        session.session_key().to_base64()
    }

    fn encrypt_group(&self, session: &mut GroupSession, plaintext: &str) -> Result<String, CryptoError> {
        Ok(session.encrypt(plaintext).to_base64())
    }

    fn pickle_account(&self, account: &Account) -> Result<String, CryptoError> {
        Ok(account.pickle().encrypt(&self.pickle_key))
    }

    fn unpickle_account(&self, pickle: &str) -> Result<Account, CryptoError> {
        let pickle = AccountPickle::from_encrypted(pickle, &self.pickle_key)
            .map_err(|e| CryptoError::Pickle { reason: e.to_string() })?;

        Ok(Account::from_pickle(pickle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> OlmEngine {
        OlmEngine::new([7; PICKLE_KEY_SIZE])
    }

    #[test]
    fn published_keys_are_not_listed_again() {
        let engine = engine();
        let mut account = engine.create_account();

        engine.generate_one_time_keys(&mut account, 5);
        assert_eq!(engine.one_time_keys(&account).len(), 5);

        engine.mark_keys_as_published(&mut account);
        assert!(engine.one_time_keys(&account).is_empty());
    }

    #[test]
    fn pickle_restores_identity() {
        let engine = engine();
        let mut account = engine.create_account();
        engine.generate_one_time_keys(&mut account, 3);

        let pickle = engine.pickle_account(&account).unwrap();
        let restored = engine.unpickle_account(&pickle).unwrap();

        assert_eq!(engine.identity_keys(&account), engine.identity_keys(&restored));
        assert_eq!(engine.one_time_keys(&account), engine.one_time_keys(&restored));
    }

    #[test]
    fn pickle_with_other_key_fails() {
        let account = engine().create_account();
        let pickle = engine().pickle_account(&account).unwrap();

        let other = OlmEngine::new([8; PICKLE_KEY_SIZE]);
        assert!(matches!(other.unpickle_account(&pickle), Err(CryptoError::Pickle { .. })));
    }

    #[test]
    fn first_pairwise_message_is_pre_key() {
        let engine = engine();
        let alice = engine.create_account();
        let mut bob = engine.create_account();
        engine.generate_one_time_keys(&mut bob, 1);

        let otk = engine.one_time_keys(&bob).remove(0).key;
        let mut session = engine
            .create_outbound_session(&alice, &engine.identity_keys(&bob).curve25519, &otk)
            .unwrap();

        let ciphertext = engine.encrypt_pairwise(&mut session, "{}").unwrap();
        assert_eq!(ciphertext.message_type, OlmCiphertext::PRE_KEY);
    }

    #[test]
    fn invalid_peer_key_is_rejected() {
        let engine = engine();
        let alice = engine.create_account();

        let result = engine.create_outbound_session(
            &alice,
            &Curve25519Key::new("not base64!"),
            &Curve25519Key::new("not base64!"),
        );
        assert!(matches!(result, Err(CryptoError::InvalidKey { .. })));
    }

    #[test]
    fn group_session_id_is_stable_across_encryptions() {
        let engine = engine();
        let mut session = engine.create_group_session();
        let id = engine.group_session_id(&session);

        let _ = engine.encrypt_group(&mut session, "one").unwrap();
        let _ = engine.encrypt_group(&mut session, "two").unwrap();

        assert_eq!(engine.group_session_id(&session), id);
    }
}
