//! The API gateway every collaborator talks to.
//!
//! One public operation per user-facing action, all following the same
//! template: return the operation's neutral result when no session exists,
//! otherwise validate the session (renewing it once if stale), pass the
//! rate limiter, and make the remote call. Polling collaborators share one
//! [`Gateway`] from as many tasks as they like.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use deckcast_twitch::{ChatSettings, HelixClient};

use crate::config::BackendConfig;
use crate::error::{BackendError, BackendResult};
use crate::hooks::BackendHooks;
use crate::ratelimit::RateLimiter;
use crate::session::Session;

/// A toggleable chat mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMode {
    /// Only followers may chat.
    FollowerOnly,
    /// Only subscribers may chat.
    SubscriberOnly,
    /// Only emotes are allowed.
    EmoteOnly,
    /// Messages are throttled per user.
    Slow,
}

impl ChatMode {
    /// The settings key Helix uses for this mode.
    pub fn api_key(&self) -> &'static str {
        match self {
            Self::FollowerOnly => "follower_mode",
            Self::SubscriberOnly => "subscriber_mode",
            Self::EmoteOnly => "emote_mode",
            Self::Slow => "slow_mode",
        }
    }

    /// Reads this mode's flag out of a settings snapshot.
    pub fn enabled_in(&self, settings: &ChatSettings) -> bool {
        match self {
            Self::FollowerOnly => settings.follower_mode,
            Self::SubscriberOnly => settings.subscriber_mode,
            Self::EmoteOnly => settings.emote_mode,
            Self::Slow => settings.slow_mode,
        }
    }
}

/// The upcoming ad break, as pollers render it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdSchedule {
    /// When the next ad runs; the Unix epoch when unknown, so pollers can
    /// treat "in the past" as "nothing scheduled" uniformly.
    pub next_ad_at: DateTime<Utc>,
    /// Snoozes remaining, or -1 when unknown.
    pub snoozes_remaining: i64,
}

impl AdSchedule {
    /// The sentinel pollers get when no session exists.
    pub fn unknown() -> Self {
        Self {
            next_ad_at: DateTime::UNIX_EPOCH,
            snoozes_remaining: -1,
        }
    }
}

/// The rate-limited, auth-validated facade over the Helix API.
pub struct Gateway {
    session: Arc<Session>,
    limiter: RateLimiter,
    /// Channel login -> id. Grows for the process lifetime; the set of
    /// channels a control surface targets is tiny.
    channels: RwLock<HashMap<String, String>>,
}

impl Gateway {
    /// Creates a gateway; loads any persisted token pair.
    pub fn new(config: BackendConfig, hooks: Arc<dyn BackendHooks>) -> BackendResult<Self> {
        let limiter = RateLimiter::new(config.rate_limit);
        let session = Arc::new(Session::new(config, hooks)?);
        Ok(Self {
            session,
            limiter,
            channels: RwLock::new(HashMap::new()),
        })
    }

    /// Starts a fresh authorization flow; see [`Session::update_client_credentials`].
    pub async fn update_client_credentials(
        &self,
        client_id: &str,
        client_secret: &str,
    ) -> BackendResult<()> {
        self.session
            .update_client_credentials(client_id, client_secret)
            .await
    }

    /// Stores a credential pair without starting a flow (startup re-seed).
    pub fn seed_client_credentials(&self, client_id: &str, client_secret: &str) {
        self.session.seed_client_credentials(client_id, client_secret);
    }

    /// Repoints token persistence at a new file.
    pub fn set_token_path(&self, path: impl Into<PathBuf>) -> BackendResult<()> {
        self.session.set_token_path(path)
    }

    /// True iff an authenticated session is live.
    pub fn is_authed(&self) -> bool {
        self.session.is_authed()
    }

    /// Stops any live auth listener; call at teardown.
    pub async fn shutdown(&self) {
        self.session.shutdown().await;
    }

    /// Creates a clip of the current stream. No-op without a session.
    pub async fn create_clip(&self) -> BackendResult<()> {
        let Some((user_id, client)) = self.ready().await? else {
            return Ok(());
        };
        self.limiter.admit().await;
        client.create_clip(&user_id).await?;
        Ok(())
    }

    /// Drops a stream marker. No-op without a session.
    pub async fn create_marker(&self) -> BackendResult<()> {
        let Some((user_id, client)) = self.ready().await? else {
            return Ok(());
        };
        self.limiter.admit().await;
        client.create_marker(&user_id).await?;
        Ok(())
    }

    /// The live viewer count; None means not live (or no session).
    pub async fn get_viewer_count(&self) -> BackendResult<Option<u64>> {
        let Some((user_id, client)) = self.ready().await? else {
            return Ok(None);
        };
        self.limiter.admit().await;
        Ok(client.stream_viewer_count(&user_id).await?)
    }

    /// Flips one chat mode and returns its new state.
    pub async fn toggle_chat_mode(&self, mode: ChatMode) -> BackendResult<bool> {
        let Some((user_id, client)) = self.ready().await? else {
            return Ok(false);
        };

        self.limiter.admit().await;
        let current = client.chat_settings(&user_id, &user_id).await?;
        let target = !mode.enabled_in(&current);

        self.limiter.admit().await;
        let updated = client
            .update_chat_setting(&user_id, &user_id, mode.api_key(), target)
            .await?;
        Ok(mode.enabled_in(&updated))
    }

    /// The current chat settings; all off without a session.
    pub async fn get_chat_settings(&self) -> BackendResult<ChatSettings> {
        let Some((user_id, client)) = self.ready().await? else {
            return Ok(ChatSettings::default());
        };
        self.limiter.admit().await;
        Ok(client.chat_settings(&user_id, &user_id).await?)
    }

    /// Sends a chat message.
    ///
    /// The target channel is resolved through the channel cache; an empty or
    /// unresolvable name falls back to the authenticated user's own channel.
    pub async fn send_message(&self, text: &str, channel_name: &str) -> BackendResult<()> {
        let Some((user_id, client)) = self.ready().await? else {
            return Ok(());
        };

        let broadcaster_id = if channel_name.trim().is_empty() {
            user_id.clone()
        } else {
            match self.resolve_channel_id(channel_name).await {
                Ok(Some(id)) => id,
                Ok(None) => {
                    debug!("channel {:?} not found, sending to own channel", channel_name);
                    user_id.clone()
                }
                Err(err) => {
                    warn!("channel lookup failed ({}), sending to own channel", err);
                    user_id.clone()
                }
            }
        };

        self.limiter.admit().await;
        client
            .send_chat_message(&broadcaster_id, &user_id, text)
            .await?;
        Ok(())
    }

    /// Snoozes the next scheduled ad. No-op without a session.
    pub async fn snooze_next_ad(&self) -> BackendResult<()> {
        let Some((user_id, client)) = self.ready().await? else {
            return Ok(());
        };
        self.limiter.admit().await;
        client.snooze_next_ad(&user_id).await?;
        Ok(())
    }

    /// Runs a commercial of the given length. No-op without a session.
    pub async fn play_ad(&self, duration_secs: u32) -> BackendResult<()> {
        let Some((user_id, client)) = self.ready().await? else {
            return Ok(());
        };
        self.limiter.admit().await;
        client.start_commercial(&user_id, duration_secs).await?;
        Ok(())
    }

    /// The upcoming ad break; the epoch/-1 sentinel without a session so
    /// pollers render "unknown" instead of erroring.
    pub async fn get_next_ad_schedule(&self) -> BackendResult<AdSchedule> {
        let Some((user_id, client)) = self.ready().await? else {
            return Ok(AdSchedule::unknown());
        };
        self.limiter.admit().await;
        let entry = client.ad_schedule(&user_id).await?;
        Ok(AdSchedule {
            next_ad_at: entry.next_ad_at.unwrap_or(DateTime::UNIX_EPOCH),
            snoozes_remaining: entry.snooze_count,
        })
    }

    /// Resolves a channel login to its id, cache first.
    pub async fn resolve_channel_id(&self, name: &str) -> BackendResult<Option<String>> {
        let login = name.trim().to_lowercase();
        if login.is_empty() {
            return Ok(None);
        }

        if let Some(id) = self.channels.read().await.get(&login) {
            return Ok(Some(id.clone()));
        }

        let Some((_, client)) = self.ready().await? else {
            return Ok(None);
        };
        self.limiter.admit().await;
        match client.user_by_login(&login).await? {
            Some(user) => {
                debug!("resolved channel {} -> {}", login, user.id);
                self.channels.write().await.insert(login, user.id.clone());
                Ok(Some(user.id))
            }
            None => Ok(None),
        }
    }

    /// The shared operation preamble: neutral None without a session, else a
    /// validated session's identity and client.
    async fn ready(&self) -> BackendResult<Option<(String, HelixClient)>> {
        if !self.session.has_session() {
            return Ok(None);
        }
        self.session.validate_auth().await?;
        let user_id = self
            .session
            .user_id()
            .ok_or(BackendError::NotAuthenticated)?;
        let client = self
            .session
            .client_snapshot()
            .await
            .ok_or(BackendError::NotAuthenticated)?;
        Ok(Some((user_id, client)))
    }
}
