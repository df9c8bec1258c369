//! Client configuration and the on-disk session file.
//!
//! The session file holds what a later invocation needs to act as the same
//! device: homeserver, user and device ids, the access token, and the key
//! that encrypts the identity pickle. The identity document itself lives next
//! to it as `identity.json`.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use base64::{Engine as _, engine::general_purpose::STANDARD_NO_PAD};
use herald_core::{Credentials, DEFAULT_ONE_TIME_KEYS, Environment};
use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Environment variable overriding the session file location.
pub const CONFIG_ENV: &str = "MATRIX_CONFIG";

/// File name of the identity document, next to the session file.
pub const IDENTITY_FILE: &str = "identity.json";

/// Size of the identity pickle key.
pub const PICKLE_KEY_LEN: usize = 32;

/// Default session file: `$MATRIX_CONFIG`, else `~/.matrix/config.json`.
pub fn default_config_path() -> Result<PathBuf, ClientError> {
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }

    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".matrix").join("config.json"))
        .ok_or(ClientError::NoHomeDir)
}

/// Settings for a [`Messenger`](crate::Messenger).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// One-time keys generated for a fresh identity and kept on the server
    pub one_time_keys: usize,
    /// Where the identity document is stored
    pub identity_path: PathBuf,
}

impl ClientConfig {
    /// Defaults for the session file at `config_path`.
    pub fn for_session_file(config_path: &Path) -> Self {
        Self {
            one_time_keys: DEFAULT_ONE_TIME_KEYS,
            identity_path: identity_path(config_path),
        }
    }
}

/// Identity document location for the session file at `config_path`.
pub fn identity_path(config_path: &Path) -> PathBuf {
    config_path.with_file_name(IDENTITY_FILE)
}

/// Persisted login state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFile {
    /// Homeserver base URL or host
    pub server: String,
    /// Access credentials
    #[serde(flatten)]
    pub credentials: Credentials,
    /// Identity pickle key (unpadded base64)
    pub pickle_key: String,
}

impl SessionFile {
    /// New session with a fresh random pickle key.
    pub fn new<E: Environment>(server: impl Into<String>, credentials: Credentials, env: &E) -> Self {
        let mut key = [0u8; PICKLE_KEY_LEN];
        env.random_bytes(&mut key);

        Self {
            server: server.into(),
            credentials,
            pickle_key: STANDARD_NO_PAD.encode(key),
        }
    }

    /// Read the session file at `path`.
    pub fn load(path: &Path) -> Result<Self, ClientError> {
        let raw = fs::read_to_string(path)
            .map_err(|source| ClientError::Io { path: path.to_path_buf(), source })?;

        serde_json::from_str(&raw)
            .map_err(|e| ClientError::Invalid { path: path.to_path_buf(), reason: e.to_string() })
    }

    /// Write the session file to `path`, creating parent directories.
    ///
    /// The file is written next to `path` and renamed over it, so readers
    /// see the old or the new session, never a partial one. On Unix it is
    /// created readable by its owner only.
    pub fn save(&self, path: &Path) -> Result<(), ClientError> {
        let io_error = |source| ClientError::Io { path: path.to_path_buf(), source };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let encoded = serde_json::to_vec_pretty(self)
            .map_err(|e| ClientError::Invalid { path: path.to_path_buf(), reason: e.to_string() })?;

        let temp = temp_path(path);
        remove_if_present(&temp).map_err(io_error)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&temp).map_err(io_error)?;
        file.write_all(&encoded).map_err(io_error)?;
        file.sync_all().map_err(io_error)?;
        drop(file);
        fs::rename(&temp, path).map_err(io_error)?;

        tracing::debug!(path = %path.display(), "saved session file");
        Ok(())
    }

    /// Delete the session file at `path` and the identity document next to
    /// it. Either may already be gone.
    pub fn remove(path: &Path) -> Result<(), ClientError> {
        let identity = identity_path(path);

        remove_if_present(path).map_err(|source| ClientError::Io { path: path.to_path_buf(), source })?;
        remove_if_present(&identity).map_err(|source| ClientError::Io { path: identity.clone(), source })?;

        tracing::debug!(path = %path.display(), "removed session file and identity");
        Ok(())
    }

    /// Decoded pickle key.
    pub fn pickle_key(&self) -> Result<[u8; PICKLE_KEY_LEN], ClientError> {
        let invalid = |reason: String| ClientError::Invalid { path: PathBuf::new(), reason };

        let bytes = STANDARD_NO_PAD
            .decode(&self.pickle_key)
            .map_err(|e| invalid(format!("pickle key: {e}")))?;

        <[u8; PICKLE_KEY_LEN]>::try_from(bytes.as_slice())
            .map_err(|_| invalid(format!("pickle key must be {PICKLE_KEY_LEN} bytes")))
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use herald_core::SystemEnv;
    use herald_proto::{DeviceId, UserId};

    use super::*;

    fn credentials() -> Credentials {
        Credentials {
            user_id: UserId::new("@bot:example.org"),
            device_id: DeviceId::new("DEVICE"),
            access_token: "secret".into(),
        }
    }

    #[test]
    fn session_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let session = SessionFile::new("https://matrix.example.org", credentials(), &SystemEnv::new());
        session.save(&path).unwrap();

        assert_eq!(SessionFile::load(&path).unwrap(), session);
        assert_eq!(session.pickle_key().unwrap().len(), PICKLE_KEY_LEN);
    }

    #[test]
    fn saving_replaces_the_previous_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let env = SystemEnv::new();

        SessionFile::new("old.example.org", credentials(), &env).save(&path).unwrap();
        let session = SessionFile::new("new.example.org", credentials(), &env);
        session.save(&path).unwrap();

        assert_eq!(SessionFile::load(&path).unwrap(), session);
        assert!(!dir.path().join("config.json.tmp").exists());
    }

    #[cfg(unix)]
    #[test]
    fn session_file_is_private_from_creation() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        // A stale temp file from an interrupted save must not lend its mode.
        fs::write(dir.path().join("config.json.tmp"), "partial").unwrap();
        fs::set_permissions(dir.path().join("config.json.tmp"), fs::Permissions::from_mode(0o644))
            .unwrap();

        SessionFile::new("x", credentials(), &SystemEnv::new()).save(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn remove_deletes_session_and_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        SessionFile::new("x", credentials(), &SystemEnv::new()).save(&path).unwrap();
        fs::write(identity_path(&path), "{}").unwrap();

        SessionFile::remove(&path).unwrap();

        assert!(!path.exists());
        assert!(!identity_path(&path).exists());
        // Already gone is fine.
        SessionFile::remove(&path).unwrap();
    }

    #[test]
    fn session_file_is_flat_json() {
        let session = SessionFile {
            server: "matrix.example.org".into(),
            credentials: credentials(),
            pickle_key: "AAAA".into(),
        };

        assert_eq!(
            serde_json::to_value(&session).unwrap(),
            serde_json::json!({
                "server": "matrix.example.org",
                "user_id": "@bot:example.org",
                "device_id": "DEVICE",
                "access_token": "secret",
                "pickle_key": "AAAA",
            })
        );
    }

    #[test]
    fn short_pickle_key_is_rejected() {
        let session = SessionFile {
            server: "x".into(),
            credentials: credentials(),
            pickle_key: STANDARD_NO_PAD.encode([1u8; 8]),
        };

        assert!(matches!(session.pickle_key(), Err(ClientError::Invalid { .. })));
    }

    #[test]
    fn identity_lives_next_to_session_file() {
        let config = ClientConfig::for_session_file(Path::new("/home/bot/.matrix/config.json"));

        assert_eq!(config.identity_path, Path::new("/home/bot/.matrix/identity.json"));
        assert_eq!(config.one_time_keys, DEFAULT_ONE_TIME_KEYS);
    }

    #[test]
    fn missing_session_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = SessionFile::load(&dir.path().join("absent.json"));

        assert!(matches!(result, Err(ClientError::Io { .. })));
    }
}
