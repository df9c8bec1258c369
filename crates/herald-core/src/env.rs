//! Environment abstraction for deterministic testing.
//!
//! Decouples session orchestration from system randomness. Production code
//! draws from the OS RNG through [`SystemEnv`](crate::SystemEnv); tests use a
//! seeded environment so transaction ids and generated values repeat run to
//! run.

/// Abstract environment providing randomness.
///
/// # Invariants
///
/// Implementations MUST guarantee:
///
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - Given the same seed, a simulated environment produces the same sequence
///   of bytes
pub trait Environment: Clone + Send + Sync + 'static {
    /// Fills the provided buffer with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Fresh transaction id for one outgoing request.
    ///
    /// A version 4 UUID built from environment randomness. The homeserver
    /// deduplicates requests by transaction id, so every room event and every
    /// to-device batch needs its own.
    fn transaction_id(&self) -> String {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        uuid::Builder::from_random_bytes(bytes).into_uuid().to_string()
    }
}
