//! Client errors.

use std::path::PathBuf;

use herald_core::{IdentityError, SessionError};
use thiserror::Error;

/// Errors raised outside the send pipeline: session file handling and setup.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Reading or writing the session file failed.
    #[error("session file {}: {source}", path.display())]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The session file exists but cannot be used.
    #[error("invalid session file {}: {reason}", path.display())]
    Invalid {
        /// File path
        path: PathBuf,
        /// What is wrong with it
        reason: String,
    },

    /// No home directory to place the default session file in.
    #[error("cannot locate a home directory; set MATRIX_CONFIG")]
    NoHomeDir,

    /// The server address is not a usable URL.
    #[error("invalid server address {server}: {reason}")]
    InvalidServer {
        /// Address as given
        server: String,
        /// Parser message
        reason: String,
    },

    /// The identity could not be loaded or created.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// A homeserver operation failed.
    #[error(transparent)]
    Session(#[from] SessionError),
}
