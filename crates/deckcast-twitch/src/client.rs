//! Helix API client.
//!
//! A thin, authenticated HTTP client over the handful of Helix endpoints the
//! gateway exposes. Every method performs exactly one request; retry and
//! rate-limiting policy belong to the caller.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{TwitchError, TwitchResult};

/// Base URL for the Helix API.
const HELIX_API_BASE: &str = "https://api.twitch.tv/helix";

/// Authenticated Helix API client.
///
/// Cheap to clone; the underlying connection pool is shared.
#[derive(Debug, Clone)]
pub struct HelixClient {
    http_client: reqwest::Client,
    base_url: String,
    client_id: String,
    access_token: String,
}

impl HelixClient {
    /// Creates a new Helix client for the given app and access token.
    pub fn new(
        client_id: impl Into<String>,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to create HTTP client");

        Self {
            http_client,
            base_url: HELIX_API_BASE.to_string(),
            client_id: client_id.into(),
            access_token: access_token.into(),
        }
    }

    /// Overrides the API base URL (stub servers in tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Swaps in a renewed access token.
    pub fn set_access_token(&mut self, token: impl Into<String>) {
        self.access_token = token.into();
    }

    /// Creates a clip of the broadcaster's live stream.
    pub async fn create_clip(&self, broadcaster_id: &str) -> TwitchResult<()> {
        let path = format!(
            "/clips?broadcaster_id={}",
            urlencoding::encode(broadcaster_id)
        );
        let response = self.post(&path).send().await.map_err(request_error)?;
        self.success_body(response).await?;
        debug!("clip created for broadcaster {}", broadcaster_id);
        Ok(())
    }

    /// Drops a stream marker at the current timestamp.
    pub async fn create_marker(&self, user_id: &str) -> TwitchResult<()> {
        let response = self
            .post("/streams/markers")
            .json(&MarkerRequest { user_id })
            .send()
            .await
            .map_err(request_error)?;
        self.success_body(response).await?;
        debug!("stream marker created for user {}", user_id);
        Ok(())
    }

    /// Returns the live viewer count, or None when the stream is offline.
    pub async fn stream_viewer_count(&self, user_id: &str) -> TwitchResult<Option<u64>> {
        let path = format!(
            "/streams?user_id={}&first=1&type=live",
            urlencoding::encode(user_id)
        );
        let response = self.get(&path).send().await.map_err(request_error)?;
        let body = self.success_body(response).await?;
        let streams: Envelope<StreamInfo> = parse(&body)?;
        Ok(streams.data.first().map(|s| s.viewer_count))
    }

    /// Fetches the broadcaster's current chat settings.
    pub async fn chat_settings(
        &self,
        broadcaster_id: &str,
        moderator_id: &str,
    ) -> TwitchResult<ChatSettings> {
        let path = format!(
            "/chat/settings?broadcaster_id={}&moderator_id={}",
            urlencoding::encode(broadcaster_id),
            urlencoding::encode(moderator_id)
        );
        let response = self.get(&path).send().await.map_err(request_error)?;
        let body = self.success_body(response).await?;
        let settings: Envelope<ChatSettings> = parse(&body)?;
        settings
            .data
            .into_iter()
            .next()
            .ok_or_else(|| TwitchError::invalid_response("chat settings response is empty"))
    }

    /// Flips a single chat setting and returns the settings Helix echoes back.
    pub async fn update_chat_setting(
        &self,
        broadcaster_id: &str,
        moderator_id: &str,
        setting_key: &str,
        enabled: bool,
    ) -> TwitchResult<ChatSettings> {
        let path = format!(
            "/chat/settings?broadcaster_id={}&moderator_id={}",
            urlencoding::encode(broadcaster_id),
            urlencoding::encode(moderator_id)
        );

        let mut patch = serde_json::Map::new();
        patch.insert(setting_key.to_string(), serde_json::Value::Bool(enabled));

        let response = self
            .patch(&path)
            .json(&patch)
            .send()
            .await
            .map_err(request_error)?;
        let body = self.success_body(response).await?;
        let settings: Envelope<ChatSettings> = parse(&body)?;
        settings
            .data
            .into_iter()
            .next()
            .ok_or_else(|| TwitchError::invalid_response("chat settings response is empty"))
    }

    /// Sends a chat message to the broadcaster's channel.
    pub async fn send_chat_message(
        &self,
        broadcaster_id: &str,
        sender_id: &str,
        message: &str,
    ) -> TwitchResult<()> {
        let response = self
            .post("/chat/messages")
            .json(&SendMessageRequest {
                broadcaster_id,
                sender_id,
                message,
            })
            .send()
            .await
            .map_err(request_error)?;
        let body = self.success_body(response).await?;

        // Helix reports moderation drops with a 200 and is_sent=false.
        let sent: Envelope<SentMessage> = parse(&body)?;
        if let Some(result) = sent.data.first()
            && !result.is_sent
        {
            let reason = result
                .drop_reason
                .as_ref()
                .map(|r| r.message.clone())
                .unwrap_or_else(|| "message dropped".to_string());
            return Err(TwitchError::bad_request(reason));
        }
        Ok(())
    }

    /// Snoozes the next scheduled ad break.
    pub async fn snooze_next_ad(&self, broadcaster_id: &str) -> TwitchResult<()> {
        let path = format!(
            "/channels/ads/schedule/snooze?broadcaster_id={}",
            urlencoding::encode(broadcaster_id)
        );
        let response = self.post(&path).send().await.map_err(request_error)?;
        self.success_body(response).await?;
        debug!("next ad snoozed for broadcaster {}", broadcaster_id);
        Ok(())
    }

    /// Starts a commercial of the given length on the broadcaster's channel.
    pub async fn start_commercial(
        &self,
        broadcaster_id: &str,
        length_secs: u32,
    ) -> TwitchResult<()> {
        let response = self
            .post("/channels/commercial")
            .json(&CommercialRequest {
                broadcaster_id,
                length: length_secs,
            })
            .send()
            .await
            .map_err(request_error)?;
        self.success_body(response).await?;
        debug!("started {}s commercial", length_secs);
        Ok(())
    }

    /// Fetches the broadcaster's ad schedule.
    pub async fn ad_schedule(&self, broadcaster_id: &str) -> TwitchResult<AdScheduleEntry> {
        let path = format!(
            "/channels/ads?broadcaster_id={}",
            urlencoding::encode(broadcaster_id)
        );
        let response = self.get(&path).send().await.map_err(request_error)?;
        let body = self.success_body(response).await?;
        let schedule: Envelope<AdScheduleEntry> = parse(&body)?;
        schedule
            .data
            .into_iter()
            .next()
            .ok_or_else(|| TwitchError::invalid_response("ad schedule response is empty"))
    }

    /// Looks up a user by login name; None if no such user exists.
    pub async fn user_by_login(&self, login: &str) -> TwitchResult<Option<HelixUser>> {
        let path = format!("/users?login={}", urlencoding::encode(login));
        let response = self.get(&path).send().await.map_err(request_error)?;
        let body = self.success_body(response).await?;
        let users: Envelope<HelixUser> = parse(&body)?;
        Ok(users.data.into_iter().next())
    }

    fn get(&self, path_and_query: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::GET, path_and_query)
    }

    fn post(&self, path_and_query: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::POST, path_and_query)
    }

    fn patch(&self, path_and_query: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::PATCH, path_and_query)
    }

    /// Builds a request with the auth headers every Helix call requires.
    fn request(&self, method: reqwest::Method, path_and_query: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path_and_query);
        self.http_client
            .request(method, url)
            .bearer_auth(&self.access_token)
            .header("Client-Id", &self.client_id)
    }

    /// Maps the response status to the error taxonomy and returns the body.
    async fn success_body(&self, response: reqwest::Response) -> TwitchResult<String> {
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("Ratelimit-Reset")
                .or_else(|| response.headers().get("Retry-After"))
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            return Err(TwitchError::rate_limited(format!(
                "rate limit exceeded{}",
                retry_after
                    .map(|s| format!(" (reset {})", s))
                    .unwrap_or_default()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| TwitchError::network(format!("failed to read response: {}", e)))?;

        if status.is_success() {
            return Ok(body);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TwitchError::authentication(format!(
                "access token rejected: {}",
                body
            )));
        }
        if status == reqwest::StatusCode::FORBIDDEN {
            return Err(TwitchError::authorization(format!(
                "missing scope or role: {}",
                body
            )));
        }
        if status == reqwest::StatusCode::BAD_REQUEST {
            return Err(TwitchError::bad_request(body));
        }
        Err(TwitchError::server(format!(
            "API error ({}): {}",
            status, body
        )))
    }
}

fn request_error(e: reqwest::Error) -> TwitchError {
    if e.is_timeout() {
        TwitchError::network("request timeout")
    } else if e.is_connect() {
        TwitchError::network(format!("connection failed: {}", e))
    } else {
        TwitchError::network(format!("request failed: {}", e))
    }
}

fn parse<T: serde::de::DeserializeOwned>(body: &str) -> TwitchResult<T> {
    serde_json::from_str(body)
        .map_err(|e| TwitchError::invalid_response(format!("failed to parse response: {}", e)))
}

/// The `data` wrapper every Helix response uses.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct Envelope<T> {
    #[serde(default)]
    data: Vec<T>,
}

/// The four toggleable chat modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    /// Only followers may chat.
    #[serde(default)]
    pub follower_mode: bool,
    /// Only subscribers may chat.
    #[serde(default)]
    pub subscriber_mode: bool,
    /// Only emotes are allowed.
    #[serde(default)]
    pub emote_mode: bool,
    /// Messages are throttled per user.
    #[serde(default)]
    pub slow_mode: bool,
}

/// A user record from the users endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct HelixUser {
    /// Numeric channel/user id.
    pub id: String,
    /// Login name (lowercase).
    pub login: String,
    /// Display name with original casing.
    #[serde(default)]
    pub display_name: Option<String>,
}

/// One entry from the ad schedule endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct AdScheduleEntry {
    /// When the next ad break runs. None when nothing is scheduled or the
    /// provider sent one of its junk zero timestamps.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub next_ad_at: Option<DateTime<Utc>>,
    /// Snoozes the broadcaster has left.
    #[serde(default)]
    pub snooze_count: i64,
}

#[derive(Debug, Deserialize)]
struct StreamInfo {
    viewer_count: u64,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    #[serde(default)]
    is_sent: bool,
    #[serde(default)]
    drop_reason: Option<DropReason>,
}

#[derive(Debug, Deserialize)]
struct DropReason {
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
struct MarkerRequest<'a> {
    user_id: &'a str,
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    broadcaster_id: &'a str,
    sender_id: &'a str,
    message: &'a str,
}

#[derive(Serialize)]
struct CommercialRequest<'a> {
    broadcaster_id: &'a str,
    length: u32,
}

/// Accepts the timestamp shapes the ads endpoint has been seen to emit:
/// RFC 3339 strings, unix seconds as string or number, and empty/zero
/// placeholders meaning "nothing scheduled".
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde_json::Value;

    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => {
            if s.is_empty() || s == "0" {
                None
            } else {
                DateTime::parse_from_rfc3339(&s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
                    .or_else(|| {
                        s.parse::<i64>()
                            .ok()
                            .filter(|secs| *secs > 0)
                            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                    })
            }
        }
        Some(Value::Number(n)) => n
            .as_i64()
            .filter(|secs| *secs > 0)
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        Some(_) => None,
    })
}
