//! Herald command-line client.
//!
//! # Usage
//!
//! ```bash
//! # Log in once; the session is stored in ~/.matrix/config.json
//! heraldctl login matrix.example.org @deploy:example.org 'secret'
//!
//! # Send a message, end-to-end encrypted
//! heraldctl msg '!ops:example.org' '<b>deploy</b> finished' --encrypted
//!
//! # Use another session file
//! MATRIX_CONFIG=/etc/herald/config.json heraldctl join '#ops:example.org'
//! ```

use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use herald_client::{
    ClientConfig, HttpTransport, Messenger, SessionFile, default_config_path, login, logout,
    register,
};
use herald_core::{Credentials, SystemEnv};
use herald_crypto::OlmEngine;
use herald_proto::RoomId;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Matrix messaging client
#[derive(Parser, Debug)]
#[command(name = "heraldctl")]
#[command(about = "Send plain or end-to-end encrypted Matrix messages")]
#[command(version)]
struct Args {
    /// Session file (defaults to ~/.matrix/config.json)
    #[arg(short, long, env = "MATRIX_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a new account and store its session
    Register {
        /// Homeserver URL or host
        server: String,
        /// User id or localpart
        user: String,
        /// Password
        password: String,
    },

    /// Log in and store the session
    Login {
        /// Homeserver URL or host
        server: String,
        /// User id or localpart
        user: String,
        /// Password
        password: String,
    },

    /// Invalidate the stored session
    Logout {
        /// Invalidate every session of the user
        #[arg(long)]
        all: bool,
    },

    /// Join a room
    Join {
        /// Room id or alias
        room: String,
    },

    /// Send an HTML message to a room
    Msg {
        /// Room id
        room: String,
        /// Message (HTML allowed)
        message: String,
        /// Encrypt end-to-end
        #[arg(short, long)]
        encrypted: bool,
    },
}

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config_path = match args.config {
        Some(path) => path,
        None => default_config_path()?,
    };

    match args.command {
        Command::Register { server, user, password } => {
            let transport = Arc::new(HttpTransport::new(&server)?);
            let credentials = register(&*transport, &user, &password).await?;
            enroll(&config_path, &server, transport, credentials).await?;
        },
        Command::Login { server, user, password } => {
            let transport = Arc::new(HttpTransport::new(&server)?);
            let credentials = login(&*transport, &user, &password).await?;
            enroll(&config_path, &server, transport, credentials).await?;
        },
        Command::Logout { all } => {
            let session = SessionFile::load(&config_path)?;
            let transport = HttpTransport::with_credentials(&session.server, &session.credentials)?;
            logout(&transport, all).await?;

            SessionFile::remove(&config_path)?;
            tracing::info!(path = %config_path.display(), "removed session");
        },
        Command::Join { room } => {
            let messenger = open(&config_path)?;
            let room_id = messenger.join_room(&RoomId::normalize(&room)).await?;
            tracing::info!(room_id = %room_id, "joined");
        },
        Command::Msg { room, message, encrypted } => {
            let messenger = open(&config_path)?;
            let room_id = RoomId::normalize(&room);

            let event_id = if encrypted {
                messenger.send_encrypted(&room_id, &message).await?
            } else {
                messenger.send(&room_id, &message).await?
            };
            tracing::info!(room_id = %room_id, event_id = %event_id, encrypted, "sent");
        },
    }

    Ok(())
}

type CliMessenger = Messenger<OlmEngine, HttpTransport, SystemEnv>;

/// Store the session, then give the new device a published identity.
async fn enroll(
    config_path: &std::path::Path,
    server: &str,
    transport: Arc<HttpTransport>,
    credentials: Credentials,
) -> Result<()> {
    let env = SystemEnv::new();
    let session = SessionFile::new(server, credentials.clone(), &env);
    session.save(config_path)?;

    let engine = Arc::new(OlmEngine::new(session.pickle_key()?));
    let config = ClientConfig::for_session_file(config_path);
    let messenger = Messenger::enroll(engine, transport, env, credentials, &config).await?;

    tracing::info!(
        user_id = %messenger.credentials().user_id,
        device_id = %messenger.credentials().device_id,
        path = %config_path.display(),
        "stored session"
    );
    Ok(())
}

/// Messenger for the stored session.
fn open(config_path: &std::path::Path) -> Result<CliMessenger> {
    let session = SessionFile::load(config_path)?;
    let transport = Arc::new(HttpTransport::with_credentials(&session.server, &session.credentials)?);
    let engine = Arc::new(OlmEngine::new(session.pickle_key()?));
    let config = ClientConfig::for_session_file(config_path);

    Ok(Messenger::open(engine, transport, SystemEnv::new(), session.credentials, &config)?)
}
