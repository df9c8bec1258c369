//! Identity store: the agent's long-term account on disk.
//!
//! The identity is created once, on first run, and restored verbatim on every
//! later run. Losing it means a new device identity, which every peer sees
//! as a different device.
//!
//! # Document
//!
//! ```json
//! { "account": "<engine pickle>", "one_time_keys": 50 }
//! ```
//!
//! # Durability
//!
//! `persist` writes a sibling temp file and renames it over the target, so a
//! crash mid-write leaves the previous document intact. Keys published to the
//! homeserver before the matching `persist` completed are a known desync
//! window: the server holds one-time keys the restored account will list
//! again.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use herald_crypto::{CryptoEngine, IdentityKeys};
use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

/// One-time keys generated for a fresh identity unless configured otherwise.
pub const DEFAULT_ONE_TIME_KEYS: usize = 50;

/// The agent's long-term account and its public identity keys.
pub struct Identity<C: CryptoEngine> {
    account: C::Account,
    keys: IdentityKeys,
}

impl<C: CryptoEngine> Identity<C> {
    fn new(engine: &C, account: C::Account) -> Self {
        let keys = engine.identity_keys(&account);
        Self { account, keys }
    }

    /// Public identity keys.
    pub fn keys(&self) -> &IdentityKeys {
        &self.keys
    }

    /// The engine account.
    pub fn account(&self) -> &C::Account {
        &self.account
    }

    /// The engine account, for key generation and publication.
    pub fn account_mut(&mut self) -> &mut C::Account {
        &mut self.account
    }
}

#[derive(Serialize, Deserialize)]
struct IdentityDocument {
    account: String,
    one_time_keys: usize,
}

/// Loads, creates and persists [`Identity`] documents.
pub struct IdentityStore<C: CryptoEngine> {
    engine: Arc<C>,
    one_time_keys: usize,
}

impl<C: CryptoEngine> IdentityStore<C> {
    /// Store creating identities with `one_time_keys` initial one-time keys.
    pub fn new(engine: Arc<C>, one_time_keys: usize) -> Self {
        Self { engine, one_time_keys }
    }

    /// Size of the one-time key pool of a fresh identity.
    pub fn one_time_keys(&self) -> usize {
        self.one_time_keys
    }

    /// Restore the identity stored at `path`.
    ///
    /// # Errors
    ///
    /// [`IdentityError::NotFound`] when no document exists; any other read
    /// or decode failure is fatal.
    pub fn load(&self, path: &Path) -> Result<Identity<C>, IdentityError> {
        let raw = fs::read_to_string(path).map_err(|source| {
            if source.kind() == ErrorKind::NotFound {
                IdentityError::NotFound { path: path.to_path_buf() }
            } else {
                IdentityError::Io { path: path.to_path_buf(), source }
            }
        })?;

        let document: IdentityDocument = serde_json::from_str(&raw)
            .map_err(|e| IdentityError::Corrupt { path: path.to_path_buf(), reason: e.to_string() })?;
        let account = self.engine.unpickle_account(&document.account)?;

        tracing::debug!(path = %path.display(), "restored identity");
        Ok(Identity::new(&self.engine, account))
    }

    /// Create a new identity with a full one-time key pool.
    ///
    /// Nothing is written; call [`IdentityStore::persist`] before using the
    /// identity against a homeserver.
    pub fn create(&self) -> Identity<C> {
        let mut account = self.engine.create_account();
        self.engine.generate_one_time_keys(&mut account, self.one_time_keys);

        Identity::new(&self.engine, account)
    }

    /// Write `identity` to `path`, replacing any previous document.
    ///
    /// # Errors
    ///
    /// Pickling or any file system failure.
    pub fn persist(&self, identity: &Identity<C>, path: &Path) -> Result<(), IdentityError> {
        let document = IdentityDocument {
            account: self.engine.pickle_account(&identity.account)?,
            one_time_keys: self.one_time_keys,
        };
        let encoded = serde_json::to_vec_pretty(&document)
            .map_err(|e| IdentityError::Corrupt { path: path.to_path_buf(), reason: e.to_string() })?;

        let io_error = |source| IdentityError::Io { path: path.to_path_buf(), source };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let temp = temp_path(path);
        fs::write(&temp, encoded).map_err(io_error)?;
        fs::rename(&temp, path).map_err(io_error)?;

        tracing::debug!(path = %path.display(), "persisted identity");
        Ok(())
    }

    /// Restore the identity at `path`, creating and persisting one first if
    /// none exists.
    ///
    /// # Errors
    ///
    /// Any failure other than the document not existing.
    pub fn load_or_create(&self, path: &Path) -> Result<Identity<C>, IdentityError> {
        match self.load(path) {
            Ok(identity) => Ok(identity),
            Err(IdentityError::NotFound { .. }) => {
                let identity = self.create();
                self.persist(&identity, path)?;

                tracing::info!(
                    path = %path.display(),
                    one_time_keys = self.one_time_keys,
                    "created new identity"
                );
                Ok(identity)
            },
            Err(e) => Err(e),
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
