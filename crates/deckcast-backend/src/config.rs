//! Backend configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{BackendError, BackendResult};

/// Local port the identity provider redirects back to.
///
/// Must match the redirect URI registered with the application; the same
/// port is reused for every authorization attempt.
pub const DEFAULT_CALLBACK_PORT: u16 = 3000;

/// Path component of the registered redirect URI.
pub const DEFAULT_CALLBACK_PATH: &str = "/auth";

/// Scopes the gateway operations need.
pub const DEFAULT_SCOPES: &[&str] = &[
    "user:write:chat",
    "channel:manage:broadcast",
    "moderator:manage:chat_settings",
    "clips:edit",
    "channel:edit:commercial",
    "channel:manage:ads",
];

/// Sliding-window rate limit settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum admitted calls per window.
    pub max_calls: usize,
    /// Length of the rolling window.
    pub period: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: 30,
            period: Duration::from_secs(60),
        }
    }
}

/// Configuration for the backend.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Port for the loopback callback listener.
    ///
    /// Port 0 binds an ephemeral port; only useful when the redirect URI is
    /// not pinned provider-side (tests, self-hosted identity stubs).
    pub callback_port: u16,

    /// Path the redirect must hit; anything else keeps the listener alive.
    pub callback_path: String,

    /// OAuth scopes requested on the consent page.
    pub scopes: Vec<String>,

    /// Timeout applied to every outbound HTTP request.
    pub timeout: Duration,

    /// Rate limit shared by all gateway operations.
    pub rate_limit: RateLimitConfig,

    /// Where the access/refresh token pair is persisted.
    pub token_path: PathBuf,

    /// Whether to open the consent URL in the default browser.
    ///
    /// When disabled the URL is only logged; headless hosts and tests.
    pub open_browser: bool,

    /// Override for the identity endpoint base URL; None means production.
    pub id_api_base: Option<String>,

    /// Override for the Helix endpoint base URL; None means production.
    pub helix_api_base: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            callback_port: DEFAULT_CALLBACK_PORT,
            callback_path: DEFAULT_CALLBACK_PATH.to_string(),
            scopes: DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect(),
            timeout: Duration::from_secs(10),
            rate_limit: RateLimitConfig::default(),
            token_path: default_token_path(),
            open_browser: true,
            id_api_base: None,
            helix_api_base: None,
        }
    }
}

impl BackendConfig {
    /// Builder method to set the callback port.
    #[must_use]
    pub fn with_callback_port(mut self, port: u16) -> Self {
        self.callback_port = port;
        self
    }

    /// Builder method to set the token file path.
    #[must_use]
    pub fn with_token_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_path = path.into();
        self
    }

    /// Builder method to set the rate limit.
    #[must_use]
    pub fn with_rate_limit(mut self, max_calls: usize, period: Duration) -> Self {
        self.rate_limit = RateLimitConfig { max_calls, period };
        self
    }

    /// Builder method to disable opening the browser.
    #[must_use]
    pub fn without_browser(mut self) -> Self {
        self.open_browser = false;
        self
    }

    /// The redirect URI as registered with the identity provider.
    pub fn redirect_uri(&self) -> String {
        self.redirect_uri_for_port(self.callback_port)
    }

    /// The redirect URI for an actually-bound port (differs from
    /// [`redirect_uri`](Self::redirect_uri) only when `callback_port` is 0).
    pub fn redirect_uri_for_port(&self, port: u16) -> String {
        format!("http://localhost:{}{}", port, self.callback_path)
    }

    /// Checks the configuration for values that cannot work.
    pub fn validate(&self) -> BackendResult<()> {
        if !self.callback_path.starts_with('/') {
            return Err(BackendError::config("callback_path must start with '/'"));
        }
        if self.scopes.is_empty() {
            return Err(BackendError::config("at least one scope is required"));
        }
        if self.rate_limit.max_calls == 0 {
            return Err(BackendError::config("rate_limit.max_calls must be positive"));
        }
        if self.rate_limit.period.is_zero() {
            return Err(BackendError::config("rate_limit.period must be positive"));
        }
        if self.timeout.is_zero() {
            return Err(BackendError::config("timeout must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
impl BackendConfig {
    /// Points both API clients at stub servers.
    pub(crate) fn into_stubbed(mut self, id_base: Option<String>, helix_base: Option<String>) -> Self {
        self.id_api_base = id_base;
        self.helix_api_base = helix_base;
        self
    }
}

/// Default location of the persisted token pair.
pub fn default_token_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("deckcast")
        .join("tokens.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BackendConfig::default();
        config.validate().unwrap();
        assert_eq!(config.callback_port, 3000);
        assert_eq!(config.callback_path, "/auth");
        assert!(config.open_browser);
        assert!(!config.scopes.is_empty());
    }

    #[test]
    fn redirect_uri_format() {
        let config = BackendConfig::default();
        assert_eq!(config.redirect_uri(), "http://localhost:3000/auth");
        assert_eq!(
            config.redirect_uri_for_port(8123),
            "http://localhost:8123/auth"
        );
    }

    #[test]
    fn rejects_zero_rate_limit() {
        let config = BackendConfig::default().with_rate_limit(0, Duration::from_secs(1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_period() {
        let config = BackendConfig::default().with_rate_limit(5, Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_relative_callback_path() {
        let mut config = BackendConfig::default();
        config.callback_path = "auth".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_token_path_ends_with_app_dir() {
        let path = default_token_path();
        assert!(path.ends_with("deckcast/tokens.json"));
    }
}
