//! OAuth token storage.
//!
//! Holds the access/refresh token pair obtained from the identity provider
//! and persists it to a JSON file so a restarted process can resume its
//! session without a fresh consent round-trip.

use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{TwitchError, TwitchResult};

/// An access/refresh token pair from the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    /// The access token sent with every API request.
    pub access_token: String,

    /// The refresh token used to renew an expired access token.
    pub refresh_token: Option<String>,

    /// When the access token expires, if the provider reported a lifetime.
    pub expires_at: Option<DateTime<Utc>>,

    /// When the pair was obtained or last renewed.
    pub obtained_at: DateTime<Utc>,
}

impl TokenPair {
    /// Creates a token pair from a token endpoint response.
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_in_secs: Option<i64>,
    ) -> Self {
        let expires_at = expires_in_secs.map(|secs| {
            // Renew slightly before the provider-reported expiry.
            Utc::now() + Duration::seconds(secs) - Duration::seconds(60)
        });

        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at,
            obtained_at: Utc::now(),
        }
    }

    /// Returns true if the access token is expired or about to expire.
    ///
    /// A pair without a reported lifetime is assumed valid; the identity
    /// probe is the authority either way.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => Utc::now() >= expires_at,
            None => false,
        }
    }
}

/// File-backed storage for the current [`TokenPair`].
///
/// The file is written atomically (temp file + rename) with restrictive
/// permissions. The path can be repointed at runtime; the next save goes to
/// the new location.
#[derive(Debug)]
pub struct TokenStore {
    path: RwLock<PathBuf>,
    tokens: RwLock<Option<TokenPair>>,
}

impl TokenStore {
    /// Creates a token store backed by the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: RwLock::new(path.into()),
            tokens: RwLock::new(None),
        }
    }

    /// Loads tokens from disk into memory.
    ///
    /// Returns Ok(true) if tokens were loaded, Ok(false) if no file exists.
    pub fn load(&self) -> TwitchResult<bool> {
        let path = self.path.read().unwrap().clone();
        if !path.exists() {
            debug!("no token file at {:?}", path);
            return Ok(false);
        }

        let content = fs::read_to_string(&path).map_err(|e| {
            TwitchError::configuration(format!("failed to read token file: {}", e))
        })?;

        let tokens: TokenPair = serde_json::from_str(&content).map_err(|e| {
            TwitchError::configuration(format!("failed to parse token file: {}", e))
        })?;

        info!("loaded tokens from {:?}", path);
        *self.tokens.write().unwrap() = Some(tokens);
        Ok(true)
    }

    /// Saves the current tokens to disk.
    pub fn save(&self) -> TwitchResult<()> {
        let tokens = self.tokens.read().unwrap();
        let tokens = tokens
            .as_ref()
            .ok_or_else(|| TwitchError::internal("no tokens to save"))?;

        let path = self.path.read().unwrap().clone();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                TwitchError::configuration(format!("failed to create token directory: {}", e))
            })?;
        }

        // Write to a temp file first, then rename for atomicity.
        let temp_path = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(tokens)
            .map_err(|e| TwitchError::internal(format!("failed to serialize tokens: {}", e)))?;

        fs::write(&temp_path, &content).map_err(|e| {
            TwitchError::configuration(format!("failed to write token file: {}", e))
        })?;

        fs::rename(&temp_path, &path).map_err(|e| {
            TwitchError::configuration(format!("failed to rename token file: {}", e))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            let _ = fs::set_permissions(&path, perms);
        }

        debug!("saved tokens to {:?}", path);
        Ok(())
    }

    /// Returns a clone of the current tokens, if any.
    pub fn get(&self) -> Option<TokenPair> {
        self.tokens.read().unwrap().clone()
    }

    /// Sets new tokens and saves them to disk.
    pub fn set(&self, tokens: TokenPair) -> TwitchResult<()> {
        *self.tokens.write().unwrap() = Some(tokens);
        self.save()
    }

    /// Clears the stored tokens, both in memory and on disk.
    pub fn clear(&self) -> TwitchResult<()> {
        *self.tokens.write().unwrap() = None;
        let path = self.path.read().unwrap().clone();
        if path.exists() {
            fs::remove_file(&path).map_err(|e| {
                TwitchError::configuration(format!("failed to remove token file: {}", e))
            })?;
            info!("cleared tokens at {:?}", path);
        }
        Ok(())
    }

    /// Returns the current token file path.
    pub fn path(&self) -> PathBuf {
        self.path.read().unwrap().clone()
    }

    /// Repoints the store at a new file path and loads from it if present.
    ///
    /// Tokens already held in memory are kept when the new file has none.
    pub fn set_path(&self, path: impl Into<PathBuf>) -> TwitchResult<()> {
        *self.path.write().unwrap() = path.into();
        let loaded = self.load()?;
        if !loaded {
            debug!("no tokens at new path {:?}, keeping in-memory pair", self.path());
        }
        Ok(())
    }

    /// Returns true if a token pair is held in memory.
    pub fn has_tokens(&self) -> bool {
        self.tokens.read().unwrap().is_some()
    }
}
