//! Twitch identity and Helix API clients.
//!
//! This crate holds everything that speaks HTTP to Twitch:
//!
//! - [`AuthClient`] - the OAuth 2.0 authorization-code grant against
//!   `id.twitch.tv`: consent URL, pre-flight probe, code exchange,
//!   refresh-token renewal, token validation
//! - [`HelixClient`] - authenticated REST calls against `api.twitch.tv/helix`
//! - [`TokenStore`] - file-backed persistence for the access/refresh pair
//! - [`TwitchError`] - the shared error taxonomy
//!
//! Session state, rate limiting, and the loopback redirect listener live in
//! the backend crate; nothing here holds long-lived mutable state beyond the
//! token store.

pub mod auth;
pub mod client;
pub mod error;
pub mod tokens;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types at crate root
pub use auth::{AuthClient, TokenIdentity};
pub use client::{AdScheduleEntry, ChatSettings, HelixClient, HelixUser};
pub use error::{TwitchError, TwitchErrorCode, TwitchResult};
pub use tokens::{TokenPair, TokenStore};
