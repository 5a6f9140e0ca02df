//! Identity-provider client for the OAuth 2.0 authorization-code grant.
//!
//! Talks to the `id.twitch.tv/oauth2` endpoints:
//!
//! 1. Build the consent URL the user's browser is sent to
//! 2. Optionally probe that URL first to fail fast on a rejected client id
//! 3. Exchange the authorization code captured by the loopback listener for
//!    an access/refresh token pair
//! 4. Renew the pair with the refresh token when the access token goes stale
//! 5. Validate the access token, which also resolves the account identity
//!
//! The loopback listener itself lives with the session, not here; this
//! client only speaks HTTP to the provider.

use std::time::Duration;

use tracing::{debug, info};

use crate::error::{TwitchError, TwitchResult};
use crate::tokens::TokenPair;

/// Base URL for the Twitch identity endpoints.
const ID_API_BASE: &str = "https://id.twitch.tv/oauth2";

/// Client for the Twitch identity endpoints.
#[derive(Debug)]
pub struct AuthClient {
    client_id: String,
    client_secret: String,
    base_url: String,
    http_client: reqwest::Client,
}

impl AuthClient {
    /// Creates a new identity client for the given application credentials.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            // The consent probe must see the provider's own status, not
            // follow it to the login page.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("failed to create HTTP client");

        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            base_url: ID_API_BASE.to_string(),
            http_client,
        }
    }

    /// Overrides the identity endpoint base URL (stub servers in tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Returns the client id this client authenticates as.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Builds the consent URL the user's browser is sent to.
    pub fn authorize_url(&self, redirect_uri: &str, scopes: &[String]) -> String {
        let scope = scopes.join(" ");
        format!(
            "{}/authorize?client_id={}&redirect_uri={}&response_type=code&scope={}",
            self.base_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scope),
        )
    }

    /// Probes the consent URL without a browser.
    ///
    /// The provider serves its login page for a well-formed request; a
    /// client-error status means the client id (or redirect URI) was
    /// rejected and opening a browser would strand the user on an error
    /// page.
    pub async fn probe_authorize(&self, redirect_uri: &str, scopes: &[String]) -> TwitchResult<()> {
        let url = self.authorize_url(redirect_uri, scopes);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| TwitchError::network(format!("consent probe failed: {}", e)))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(TwitchError::bad_request(format!(
                "identity provider rejected the client id ({})",
                status
            )));
        }

        debug!("consent probe ok ({})", status);
        Ok(())
    }

    /// Exchanges an authorization code for an access/refresh token pair.
    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> TwitchResult<TokenPair> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
        ];

        let response = self.token_request(&params).await?;
        info!("authorization code exchanged for tokens");
        Ok(response)
    }

    /// Renews the token pair using a refresh token.
    ///
    /// The provider rotates the refresh token on every renewal; the returned
    /// pair replaces the stored one entirely.
    pub async fn refresh(&self, refresh_token: &str) -> TwitchResult<TokenPair> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let response = self.token_request(&params).await?;
        info!("access token renewed via refresh token");
        Ok(response)
    }

    /// Validates an access token and resolves the account it belongs to.
    ///
    /// This is the cheap probe run before every privileged call.
    pub async fn validate(&self, access_token: &str) -> TwitchResult<TokenIdentity> {
        let url = format!("{}/validate", self.base_url);
        let response = self
            .http_client
            .get(&url)
            // The validate endpoint wants the legacy "OAuth" scheme.
            .header("Authorization", format!("OAuth {}", access_token))
            .send()
            .await
            .map_err(|e| TwitchError::network(format!("validate request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TwitchError::network(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(TwitchError::authentication(format!(
                "token validation failed ({}): {}",
                status, body
            )));
        }

        let identity: TokenIdentity = serde_json::from_str(&body).map_err(|e| {
            TwitchError::invalid_response(format!("invalid validate response: {}", e))
        })?;

        debug!("token valid for user {} ({})", identity.login, identity.user_id);
        Ok(identity)
    }

    /// Posts to the token endpoint and parses the response into a pair.
    async fn token_request(&self, params: &[(&str, &str)]) -> TwitchResult<TokenPair> {
        let url = format!("{}/token", self.base_url);
        let response = self
            .http_client
            .post(&url)
            .form(params)
            .send()
            .await
            .map_err(|e| TwitchError::network(format!("token request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TwitchError::network(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(TwitchError::authentication(format!(
                "token request failed ({}): {}",
                status, body
            )));
        }

        let token_response: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| TwitchError::invalid_response(format!("invalid token response: {}", e)))?;

        Ok(TokenPair::new(
            token_response.access_token,
            token_response.refresh_token,
            token_response.expires_in,
        ))
    }
}

/// The account an access token belongs to, per the validate endpoint.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TokenIdentity {
    /// Numeric account id, used as broadcaster/moderator id in Helix calls.
    pub user_id: String,
    /// Login name of the account.
    pub login: String,
    /// The application the token was issued to.
    #[serde(default)]
    pub client_id: String,
    /// Scopes granted to the token.
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Seconds until the token expires.
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Response from the token endpoint.
#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}
