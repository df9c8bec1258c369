//! Production environment backed by the OS RNG.

use crate::env::Environment;

/// Production environment using getrandom.
///
/// # Panics
///
/// Panics if the OS RNG fails. An agent without working cryptographic
/// randomness cannot produce unpredictable transaction ids or key material.
#[derive(Debug, Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_bytes_fill_buffer() {
        let env = SystemEnv::new();
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        env.random_bytes(&mut a);
        env.random_bytes(&mut b);

        assert_ne!(a, b);
    }

    #[test]
    fn transaction_ids_are_v4_uuids() {
        let env = SystemEnv::new();
        let txn = env.transaction_id();

        let parsed = uuid::Uuid::parse_str(&txn).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
        assert_ne!(txn, env.transaction_id());
    }
}
