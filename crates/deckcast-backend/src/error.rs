//! Backend error types.

use std::io;
use thiserror::Error;

use deckcast_twitch::TwitchError;

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors that can occur in the backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// No authenticated session is available.
    #[error("not authenticated")]
    NotAuthenticated,

    /// The local callback listener could not be started.
    #[error("failed to start auth callback listener: {0}")]
    ListenerStartup(#[source] io::Error),

    /// The identity provider rejected the consent request before redirect.
    #[error("consent request rejected: {message}")]
    ConsentRejected { message: String },

    /// The authorization code exchange failed.
    #[error("authorization exchange failed: {0}")]
    Exchange(#[source] TwitchError),

    /// The session probe failed and the silent renewal failed too.
    #[error("session stale and renewal failed: {0}")]
    SessionStale(#[source] TwitchError),

    /// A remote API call failed with a valid session.
    #[error("API call failed: {0}")]
    Api(#[from] TwitchError),

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

impl BackendError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a consent rejection error.
    pub fn consent_rejected(message: impl Into<String>) -> Self {
        Self::ConsentRejected {
            message: message.into(),
        }
    }
}
