//! Herald Client
//!
//! The caller-facing half of Herald: a [`Messenger`] bound to one logged-in
//! device, the account lifecycle that produces it, and the session file that
//! lets the next process pick up where this one stopped.
//!
//! # Transports
//!
//! The messenger is generic over [`herald_core::Transport`]. With the `http`
//! feature (on by default), [`HttpTransport`] speaks the Matrix
//! client-server API over reqwest.
//!
//! # Example
//!
//! ```ignore
//! let session = SessionFile::load(&path)?;
//! let transport = Arc::new(HttpTransport::with_credentials(&session.server, &session.credentials)?);
//! let engine = Arc::new(OlmEngine::new(session.pickle_key()?));
//! let config = ClientConfig::for_session_file(&path);
//!
//! let messenger = Messenger::open(engine, transport, SystemEnv::new(), session.credentials, &config)?;
//! messenger.send_encrypted(&RoomId::new("!abc:example.org"), "<b>deployed</b>").await?;
//! ```

#![forbid(unsafe_code)]

pub mod account;
pub mod config;
pub mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod messenger;
pub mod plain_text;

pub use account::{login, logout, register};
pub use config::{ClientConfig, SessionFile, default_config_path};
pub use error::ClientError;
#[cfg(feature = "http")]
pub use http::HttpTransport;
pub use messenger::Messenger;
pub use plain_text::html_to_text;
