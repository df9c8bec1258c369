//! Account lifecycle: registration, login and logout.
//!
//! A successful registration or login yields a new device. The device gets a
//! new identity (replacing any document at the configured path), which is
//! persisted and published before the messenger is handed back. Logging out
//! needs only the access token.

use std::sync::Arc;

use herald_core::{
    Credentials, Environment, IdentityStore, Operation, SessionError, Transport, TransportError,
};
use herald_crypto::CryptoEngine;

use crate::{config::ClientConfig, error::ClientError, messenger::Messenger};

/// Register `user`, answering a dummy interactive-auth stage if asked.
///
/// # Errors
///
/// The server refused the registration.
pub async fn register<T: Transport>(
    transport: &T,
    user: &str,
    password: &str,
) -> Result<Credentials, SessionError> {
    let credentials = match transport.register(user, password, None).await {
        Ok(credentials) => credentials,
        Err(TransportError::AuthRequired { session }) => {
            tracing::debug!(user, "registration requires interactive auth, retrying");
            transport
                .register(user, password, Some(&session))
                .await
                .map_err(SessionError::transport(Operation::Register))?
        },
        Err(e) => return Err(SessionError::transport(Operation::Register)(e)),
    };

    tracing::info!(user_id = %credentials.user_id, device_id = %credentials.device_id, "registered");
    Ok(credentials)
}

/// Log in with a password.
///
/// # Errors
///
/// Wrong credentials surface as [`SessionError::Authentication`].
pub async fn login<T: Transport>(
    transport: &T,
    user: &str,
    password: &str,
) -> Result<Credentials, SessionError> {
    let credentials = transport
        .login(user, password)
        .await
        .map_err(SessionError::transport(Operation::Login))?;

    tracing::info!(user_id = %credentials.user_id, device_id = %credentials.device_id, "logged in");
    Ok(credentials)
}

/// Invalidate the transport's access token, or every token of the user
/// when `all` is set.
pub async fn logout<T: Transport>(transport: &T, all: bool) -> Result<(), SessionError> {
    let result = if all { transport.logout_all().await } else { transport.logout().await };
    result.map_err(SessionError::transport(Operation::Logout))?;

    tracing::info!(all, "logged out");
    Ok(())
}

impl<C: CryptoEngine, T: Transport, E: Environment> Messenger<C, T, E> {
    /// Register a new account and set up its device.
    pub async fn register(
        engine: Arc<C>,
        transport: Arc<T>,
        env: E,
        config: &ClientConfig,
        user: &str,
        password: &str,
    ) -> Result<Self, ClientError> {
        let credentials = register(&*transport, user, password).await?;
        Self::enroll(engine, transport, env, credentials, config).await
    }

    /// Log in and set up the new device.
    pub async fn login(
        engine: Arc<C>,
        transport: Arc<T>,
        env: E,
        config: &ClientConfig,
        user: &str,
        password: &str,
    ) -> Result<Self, ClientError> {
        let credentials = login(&*transport, user, password).await?;
        Self::enroll(engine, transport, env, credentials, config).await
    }

    /// Create, persist and publish a fresh identity for a device that just
    /// logged in or registered.
    pub async fn enroll(
        engine: Arc<C>,
        transport: Arc<T>,
        env: E,
        credentials: Credentials,
        config: &ClientConfig,
    ) -> Result<Self, ClientError> {
        let store = IdentityStore::new(Arc::clone(&engine), config.one_time_keys);
        let identity = store.create();
        store.persist(&identity, &config.identity_path)?;

        let messenger = Self::new(engine, transport, env, credentials, identity, config);
        messenger.publish_keys().await?;
        Ok(messenger)
    }
}
