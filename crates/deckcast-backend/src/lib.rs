//! Control-surface backend for Twitch.
//!
//! This crate is the long-running core a stream-deck style host embeds. It
//! brokers every user action (send a message, create a clip, toggle a chat
//! mode, snooze an ad) into an authenticated, rate-limited Helix call:
//!
//! - [`Gateway`] - the facade collaborators call; one operation per action
//! - [`Session`] - the authentication state machine behind it
//! - [`RateLimiter`] - the sliding-window gate every call passes
//! - [`AuthCallbackListener`] - the transient loopback endpoint that catches
//!   the OAuth redirect
//! - [`BackendHooks`] - how the host hears about auth results and validated
//!   credentials
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use deckcast_backend::{BackendConfig, Gateway, NoopHooks};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let gateway = Gateway::new(BackendConfig::default(), Arc::new(NoopHooks))?;
//!
//!     // Kick off the browser consent flow...
//!     gateway.update_client_credentials("client-id", "client-secret").await?;
//!
//!     // ...and poll from as many tasks as needed.
//!     let viewers = gateway.get_viewer_count().await?;
//!     println!("{:?}", viewers);
//!     Ok(())
//! }
//! ```

mod config;
mod credentials;
mod error;
mod gateway;
mod hooks;
mod listener;
mod ratelimit;
mod session;
pub mod tracing;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{
    BackendConfig, DEFAULT_CALLBACK_PATH, DEFAULT_CALLBACK_PORT, DEFAULT_SCOPES, RateLimitConfig,
    default_token_path,
};
pub use credentials::CredentialStore;
pub use error::{BackendError, BackendResult};
pub use gateway::{AdSchedule, ChatMode, Gateway};
pub use hooks::{BackendHooks, NoopHooks};
pub use listener::{AuthCallbackListener, CallbackResult};
pub use ratelimit::RateLimiter;
pub use session::{AuthState, Session};

// Types that cross the crate boundary unchanged.
pub use deckcast_twitch::{ChatSettings, TwitchError, TwitchErrorCode};
