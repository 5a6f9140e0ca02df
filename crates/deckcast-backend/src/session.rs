//! The authentication state machine.
//!
//! A [`Session`] owns the authenticated Helix client and the account
//! identity derived from it, and drives every transition of the
//! authorization flow:
//!
//! ```text
//! Unauthenticated --update_client_credentials--> AwaitingCode
//! AwaitingCode --code redirect--> Exchanging --ok--> Authenticated
//! AwaitingCode --error redirect--> Failed
//! Exchanging --error--> Failed
//! Authenticated --probe failure--> Exchanging (silent renewal) --> Authenticated | Failed
//! Failed --update_client_credentials--> AwaitingCode
//! ```
//!
//! Authorization is single-flight: a new attempt tears down the previous
//! listener before binding, and renewal serializes on one lock. State is
//! read by many concurrent gateway calls but only one transition is ever in
//! flight.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::oneshot;
use tokio::sync::{Mutex as TokioMutex, RwLock as TokioRwLock};
use tracing::{debug, info, warn};

use deckcast_twitch::{AuthClient, HelixClient, TokenIdentity, TokenPair, TokenStore, TwitchError};

use crate::config::BackendConfig;
use crate::credentials::CredentialStore;
use crate::error::{BackendError, BackendResult};
use crate::hooks::BackendHooks;
use crate::listener::{AuthCallbackListener, CallbackResult};

/// Where the session is in the authorization flow.
///
/// The user id lives inside `Authenticated`, so "identity known iff
/// authenticated" holds by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// No flow has run and no usable tokens are loaded.
    Unauthenticated,
    /// Consent page opened; waiting for the redirect.
    AwaitingCode,
    /// Exchanging a code or renewing a stale token.
    Exchanging,
    /// A valid session with a resolved account identity.
    Authenticated {
        /// The authenticated account's numeric id.
        user_id: String,
    },
    /// The last attempt failed; a fresh credential update restarts the flow.
    Failed {
        /// Displayable failure reason.
        reason: String,
    },
}

/// The authenticated-session owner.
pub struct Session {
    config: BackendConfig,
    credentials: RwLock<CredentialStore>,
    tokens: TokenStore,
    state: RwLock<AuthState>,
    client: TokioRwLock<Option<HelixClient>>,
    listener: TokioMutex<Option<AuthCallbackListener>>,
    renewal: TokioMutex<()>,
    /// Monotonic authorization-attempt counter; stale attempts check it
    /// before touching state.
    attempt: AtomicU64,
    hooks: Arc<dyn BackendHooks>,
}

impl Session {
    /// Creates a session, loading any token pair persisted by an earlier run.
    pub fn new(config: BackendConfig, hooks: Arc<dyn BackendHooks>) -> BackendResult<Self> {
        config.validate()?;

        let tokens = TokenStore::new(&config.token_path);
        if let Err(err) = tokens.load() {
            warn!("ignoring unreadable token file: {}", err);
        }

        Ok(Self {
            config,
            credentials: RwLock::new(CredentialStore::default()),
            tokens,
            state: RwLock::new(AuthState::Unauthenticated),
            client: TokioRwLock::new(None),
            listener: TokioMutex::new(None),
            renewal: TokioMutex::new(()),
            attempt: AtomicU64::new(0),
            hooks,
        })
    }

    /// Starts a fresh authorization flow with new application credentials.
    ///
    /// Tears down any previous attempt, binds the redirect listener, probes
    /// the consent URL, and opens the browser. Returns once the flow is in
    /// `AwaitingCode`; the exchange itself completes on a background task
    /// and reports through the hooks.
    ///
    /// An empty client id or secret is a logged no-op.
    pub async fn update_client_credentials(
        self: &Arc<Self>,
        client_id: &str,
        client_secret: &str,
    ) -> BackendResult<()> {
        if client_id.trim().is_empty() || client_secret.trim().is_empty() {
            warn!("ignoring credential update with empty client id or secret");
            return Ok(());
        }

        self.credentials
            .write()
            .unwrap()
            .set_client_pair(client_id, client_secret);
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;

        // Single-flight: the previous listener must be fully stopped before
        // its port is rebound.
        let mut slot = self.listener.lock().await;
        if let Some(previous) = slot.take() {
            debug!("superseding previous authorization attempt");
            previous.stop().await;
        }

        let (sink, redirect) = oneshot::channel();
        let listener = match AuthCallbackListener::bind(
            self.config.callback_port,
            &self.config.callback_path,
            sink,
        )
        .await
        {
            Ok(listener) => listener,
            Err(err) => {
                drop(slot);
                let message = format!("failed to start callback listener: {}", err);
                self.fail_auth(&message);
                return Err(BackendError::ListenerStartup(err));
            }
        };
        let redirect_uri = self.config.redirect_uri_for_port(listener.port());

        // Fail fast if the provider refuses the client id; without this the
        // user lands on a provider error page and nothing ever redirects.
        let auth = self.auth_client();
        if let Err(err) = auth
            .probe_authorize(&redirect_uri, &self.config.scopes)
            .await
        {
            listener.stop().await;
            drop(slot);
            let message = format!("consent request rejected: {}", err);
            self.fail_auth(&message);
            return Err(BackendError::consent_rejected(err.to_string()));
        }

        *slot = Some(listener);
        drop(slot);

        self.set_state(AuthState::AwaitingCode);

        let consent_url = auth.authorize_url(&redirect_uri, &self.config.scopes);
        if self.config.open_browser {
            if let Err(err) = open::that(&consent_url) {
                warn!("failed to open browser: {}", err);
                info!("authorize manually at {}", consent_url);
            }
        } else {
            info!("browser opening disabled; authorize at {}", consent_url);
        }

        let session = Arc::clone(self);
        tokio::spawn(async move {
            session
                .finish_authorization(attempt, redirect_uri, redirect)
                .await;
        });
        Ok(())
    }

    /// Completes one authorization attempt once the redirect arrives.
    async fn finish_authorization(
        self: Arc<Self>,
        attempt: u64,
        redirect_uri: String,
        redirect: oneshot::Receiver<CallbackResult>,
    ) {
        let result = match redirect.await {
            Ok(result) => result,
            Err(_) => {
                debug!("authorization attempt ended without a redirect");
                return;
            }
        };

        if self.attempt.load(Ordering::SeqCst) != attempt {
            debug!("discarding redirect for a superseded attempt");
            return;
        }

        // The serving task exits after delivering; dropping the handle
        // releases the port for the next attempt.
        {
            let mut slot = self.listener.lock().await;
            if self.attempt.load(Ordering::SeqCst) == attempt {
                *slot = None;
            }
        }

        match result {
            CallbackResult::Denied(message) => {
                self.fail_auth(&format!("authorization denied: {}", message));
            }
            CallbackResult::Code(code) => {
                self.set_state(AuthState::Exchanging);
                match self.exchange(&code, &redirect_uri).await {
                    Ok(identity) => {
                        self.credentials
                            .write()
                            .unwrap()
                            .set_authorization_code(&code);
                        self.set_state(AuthState::Authenticated {
                            user_id: identity.user_id.clone(),
                        });

                        let (client_id, client_secret) = {
                            let creds = self.credentials.read().unwrap();
                            (
                                creds.client_id().to_string(),
                                creds.client_secret().to_string(),
                            )
                        };
                        self.hooks
                            .on_credentials_validated(&client_id, &client_secret, &code);
                        self.hooks
                            .on_auth_result(true, &format!("authenticated as {}", identity.login));
                        info!(
                            "authorization complete for {} ({})",
                            identity.login, identity.user_id
                        );
                    }
                    Err(err) => {
                        self.fail_auth(&format!("authorization exchange failed: {}", err));
                    }
                }
            }
        }
    }

    /// Exchanges a code, resolves the identity, and installs the client.
    async fn exchange(&self, code: &str, redirect_uri: &str) -> BackendResult<TokenIdentity> {
        let auth = self.auth_client();
        let pair = auth
            .exchange_code(code, redirect_uri)
            .await
            .map_err(BackendError::Exchange)?;
        let identity = auth
            .validate(&pair.access_token)
            .await
            .map_err(BackendError::Exchange)?;

        if let Err(err) = self.tokens.set(pair.clone()) {
            warn!("failed to persist tokens: {}", err);
        }
        self.install_client(&identity, &pair).await;
        Ok(identity)
    }

    /// Probes the session before a privileged call, renewing it once if the
    /// probe fails.
    ///
    /// The probe also resolves the account identity, which is how a process
    /// restarted with persisted tokens becomes `Authenticated` without a
    /// consent round-trip.
    pub async fn validate_auth(&self) -> BackendResult<()> {
        let Some(pair) = self.tokens.get() else {
            return Err(BackendError::NotAuthenticated);
        };

        let auth = self.auth_client();
        match auth.validate(&pair.access_token).await {
            Ok(identity) => {
                self.install_client(&identity, &pair).await;
                self.set_state(AuthState::Authenticated {
                    user_id: identity.user_id,
                });
                Ok(())
            }
            Err(probe_err) => {
                debug!("session probe failed: {}", probe_err);
                self.renew(&auth).await
            }
        }
    }

    /// One silent renewal via the refresh token.
    async fn renew(&self, auth: &AuthClient) -> BackendResult<()> {
        let _flight = self.renewal.lock().await;

        // A concurrent caller may have renewed while we waited on the lock.
        if let Some(pair) = self.tokens.get()
            && let Ok(identity) = auth.validate(&pair.access_token).await
        {
            self.install_client(&identity, &pair).await;
            self.set_state(AuthState::Authenticated {
                user_id: identity.user_id,
            });
            return Ok(());
        }

        let Some(refresh_token) = self.tokens.get().and_then(|p| p.refresh_token) else {
            let message = "session stale and no refresh token available".to_string();
            self.set_state(AuthState::Failed {
                reason: message.clone(),
            });
            return Err(BackendError::SessionStale(TwitchError::authentication(
                message,
            )));
        };

        info!("access token stale, renewing via refresh token");
        self.set_state(AuthState::Exchanging);
        let pair = match auth.refresh(&refresh_token).await {
            Ok(pair) => pair,
            Err(err) => {
                self.set_state(AuthState::Failed {
                    reason: err.to_string(),
                });
                return Err(BackendError::SessionStale(err));
            }
        };

        if let Err(err) = self.tokens.set(pair.clone()) {
            warn!("failed to persist renewed tokens: {}", err);
        }

        match auth.validate(&pair.access_token).await {
            Ok(identity) => {
                self.install_client(&identity, &pair).await;
                self.set_state(AuthState::Authenticated {
                    user_id: identity.user_id,
                });
                info!("session renewed");
                Ok(())
            }
            Err(err) => {
                self.set_state(AuthState::Failed {
                    reason: err.to_string(),
                });
                Err(BackendError::SessionStale(err))
            }
        }
    }

    /// Creates or refreshes the Helix client for a validated token.
    async fn install_client(&self, identity: &TokenIdentity, pair: &TokenPair) {
        let mut guard = self.client.write().await;
        match guard.as_mut() {
            Some(client) => client.set_access_token(&pair.access_token),
            None => {
                // Prefer the collaborator-supplied client id; after a
                // restart only the validate response knows it.
                let client_id = {
                    let creds = self.credentials.read().unwrap();
                    if creds.client_id().is_empty() {
                        identity.client_id.clone()
                    } else {
                        creds.client_id().to_string()
                    }
                };
                let mut client = HelixClient::new(client_id, &pair.access_token, self.config.timeout);
                if let Some(base) = &self.config.helix_api_base {
                    client = client.with_base_url(base);
                }
                *guard = Some(client);
            }
        }
    }

    /// Stores a credential pair without starting an authorization flow.
    ///
    /// For hosts re-seeding persisted credentials at startup; the loaded
    /// token pair then carries the session through the first probe.
    pub fn seed_client_credentials(&self, client_id: &str, client_secret: &str) {
        if client_id.is_empty() || client_secret.is_empty() {
            return;
        }
        debug!("seeding client credentials without authorization flow");
        self.credentials
            .write()
            .unwrap()
            .set_client_pair(client_id, client_secret);
    }

    /// Repoints token persistence at a new file.
    pub fn set_token_path(&self, path: impl Into<std::path::PathBuf>) -> BackendResult<()> {
        self.tokens
            .set_path(path)
            .map_err(|e| BackendError::config(e.to_string()))
    }

    /// Returns true iff the state is `Authenticated`.
    pub fn is_authed(&self) -> bool {
        matches!(*self.state.read().unwrap(), AuthState::Authenticated { .. })
    }

    /// The authenticated account id, if any.
    pub fn user_id(&self) -> Option<String> {
        match &*self.state.read().unwrap() {
            AuthState::Authenticated { user_id } => Some(user_id.clone()),
            _ => None,
        }
    }

    /// A clone of the current state.
    pub fn state(&self) -> AuthState {
        self.state.read().unwrap().clone()
    }

    /// True when tokens exist to even attempt a privileged call with.
    pub fn has_session(&self) -> bool {
        self.tokens.has_tokens()
    }

    /// A clone of the Helix client, if one is installed.
    pub async fn client_snapshot(&self) -> Option<HelixClient> {
        self.client.read().await.clone()
    }

    /// Stops any live listener; call at teardown.
    pub async fn shutdown(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.stop().await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn bound_callback_port(&self) -> Option<u16> {
        self.listener.lock().await.as_ref().map(|l| l.port())
    }

    /// Records a failed attempt and tells the collaborator.
    fn fail_auth(&self, message: &str) {
        warn!("{}", message);
        self.set_state(AuthState::Failed {
            reason: message.to_string(),
        });
        self.hooks.on_auth_result(false, message);
    }

    fn set_state(&self, next: AuthState) {
        let mut state = self.state.write().unwrap();
        if *state != next {
            debug!("auth state {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    /// An identity client for the currently stored application credentials.
    fn auth_client(&self) -> AuthClient {
        let creds = self.credentials.read().unwrap();
        let mut client = AuthClient::new(
            creds.client_id(),
            creds.client_secret(),
            self.config.timeout,
        );
        if let Some(base) = &self.config.id_api_base {
            client = client.with_base_url(base);
        }
        client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{RecordingHooks, StubServer, send_redirect, wait_until};

    fn test_config(id_stub: &StubServer) -> (BackendConfig, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig::default()
            .with_callback_port(0)
            .with_token_path(dir.path().join("tokens.json"))
            .without_browser()
            .into_stubbed(Some(id_stub.base.clone()), None);
        (config, dir)
    }

    fn session(config: BackendConfig, hooks: Arc<RecordingHooks>) -> Arc<Session> {
        Arc::new(Session::new(config, hooks).unwrap())
    }

    #[tokio::test]
    async fn starts_unauthenticated() {
        let stub = StubServer::identity_ok().await;
        let (config, _dir) = test_config(&stub);
        let session = session(config, Arc::new(RecordingHooks::default()));

        assert_eq!(session.state(), AuthState::Unauthenticated);
        assert!(!session.is_authed());
        assert!(session.user_id().is_none());
        assert!(!session.has_session());
    }

    #[tokio::test]
    async fn empty_credentials_are_a_noop() {
        let stub = StubServer::identity_ok().await;
        let hooks = Arc::new(RecordingHooks::default());
        let (config, _dir) = test_config(&stub);
        let session = session(config, Arc::clone(&hooks));

        session.update_client_credentials("", "secret").await.unwrap();
        session.update_client_credentials("id", "").await.unwrap();

        assert_eq!(session.state(), AuthState::Unauthenticated);
        assert!(hooks.auth_results().is_empty());
        assert!(session.bound_callback_port().await.is_none());
    }

    #[tokio::test]
    async fn full_authorization_flow() {
        let stub = StubServer::identity_ok().await;
        let hooks = Arc::new(RecordingHooks::default());
        let (config, _dir) = test_config(&stub);
        let session = session(config, Arc::clone(&hooks));

        session
            .update_client_credentials("the-id", "the-secret")
            .await
            .unwrap();
        assert_eq!(session.state(), AuthState::AwaitingCode);

        let port = session.bound_callback_port().await.unwrap();
        send_redirect(port, "/auth?code=abc123").await;

        wait_until(|| session.is_authed()).await;

        let results = hooks.auth_results();
        assert_eq!(results.len(), 1);
        assert!(results[0].0);
        assert!(results[0].1.contains("streamer"));

        let validated = hooks.validated_credentials();
        assert_eq!(validated.len(), 1);
        assert_eq!(
            validated[0],
            (
                "the-id".to_string(),
                "the-secret".to_string(),
                "abc123".to_string()
            )
        );

        assert_eq!(session.user_id().as_deref(), Some("1234"));
        assert!(session.has_session());
        // The listener is gone once the attempt completes.
        assert!(session.bound_callback_port().await.is_none());
    }

    #[tokio::test]
    async fn denied_redirect_fails_the_attempt() {
        let stub = StubServer::identity_ok().await;
        let hooks = Arc::new(RecordingHooks::default());
        let (config, _dir) = test_config(&stub);
        let session = session(config, Arc::clone(&hooks));

        session
            .update_client_credentials("the-id", "the-secret")
            .await
            .unwrap();
        let port = session.bound_callback_port().await.unwrap();
        send_redirect(port, "/auth?error=access_denied").await;

        wait_until(|| !hooks.auth_results().is_empty()).await;

        let results = hooks.auth_results();
        assert_eq!(results.len(), 1);
        assert!(!results[0].0);
        assert!(results[0].1.contains("access_denied"));

        assert!(!session.is_authed());
        assert!(matches!(session.state(), AuthState::Failed { .. }));
        assert!(hooks.validated_credentials().is_empty());
    }

    #[tokio::test]
    async fn rejected_exchange_fails_the_attempt() {
        let stub = StubServer::identity_exchange_rejected().await;
        let hooks = Arc::new(RecordingHooks::default());
        let (config, _dir) = test_config(&stub);
        let session = session(config, Arc::clone(&hooks));

        session
            .update_client_credentials("the-id", "the-secret")
            .await
            .unwrap();
        let port = session.bound_callback_port().await.unwrap();
        send_redirect(port, "/auth?code=stale").await;

        wait_until(|| !hooks.auth_results().is_empty()).await;

        let results = hooks.auth_results();
        assert!(!results[0].0);
        assert!(matches!(session.state(), AuthState::Failed { .. }));
        assert!(!session.is_authed());
    }

    #[tokio::test]
    async fn consent_probe_rejection_fails_fast() {
        let stub = StubServer::identity_consent_rejected().await;
        let hooks = Arc::new(RecordingHooks::default());
        let (config, _dir) = test_config(&stub);
        let session = session(config, Arc::clone(&hooks));

        let err = session
            .update_client_credentials("bad-id", "secret")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::ConsentRejected { .. }));

        let results = hooks.auth_results();
        assert_eq!(results.len(), 1);
        assert!(!results[0].0);
        // The listener never outlives the rejected attempt.
        assert!(session.bound_callback_port().await.is_none());
    }

    #[tokio::test]
    async fn new_attempt_supersedes_previous_listener() {
        let stub = StubServer::identity_ok().await;
        let hooks = Arc::new(RecordingHooks::default());

        // Pin one real port so both attempts contend for it.
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };
        let dir = tempfile::tempdir().unwrap();
        let config = BackendConfig::default()
            .with_callback_port(port)
            .with_token_path(dir.path().join("tokens.json"))
            .without_browser()
            .into_stubbed(Some(stub.base.clone()), None);
        let session = session(config, Arc::clone(&hooks));

        session
            .update_client_credentials("first-id", "secret")
            .await
            .unwrap();
        // Binding the same port again only works because the previous
        // listener is fully stopped first.
        session
            .update_client_credentials("second-id", "secret")
            .await
            .unwrap();
        assert_eq!(session.bound_callback_port().await, Some(port));

        send_redirect(port, "/auth?code=second-code").await;
        wait_until(|| session.is_authed()).await;

        // Only the surviving attempt reported.
        let results = hooks.auth_results();
        assert_eq!(results.len(), 1);
        assert!(results[0].0);
        assert_eq!(hooks.validated_credentials().len(), 1);
        assert_eq!(hooks.validated_credentials()[0].2, "second-code");
    }

    #[tokio::test]
    async fn restart_with_persisted_tokens_promotes_on_probe() {
        let stub = StubServer::identity_ok().await;
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("tokens.json");

        // A previous run left a token pair behind.
        let store = TokenStore::new(&token_path);
        store
            .set(TokenPair::new("persisted-access", Some("ref".to_string()), None))
            .unwrap();

        let config = BackendConfig::default()
            .with_callback_port(0)
            .with_token_path(&token_path)
            .without_browser()
            .into_stubbed(Some(stub.base.clone()), None);
        let session = session(config, Arc::new(RecordingHooks::default()));

        assert!(session.has_session());
        assert!(!session.is_authed());

        session.validate_auth().await.unwrap();
        assert!(session.is_authed());
        assert_eq!(session.user_id().as_deref(), Some("1234"));
        assert!(session.client_snapshot().await.is_some());
    }

    #[tokio::test]
    async fn stale_probe_renews_via_refresh_token() {
        let stub = StubServer::identity_stale_then_renewed().await;
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("tokens.json");
        let store = TokenStore::new(&token_path);
        store
            .set(TokenPair::new("stale-access", Some("the-refresh".to_string()), None))
            .unwrap();

        let config = BackendConfig::default()
            .with_callback_port(0)
            .with_token_path(&token_path)
            .without_browser()
            .into_stubbed(Some(stub.base.clone()), None);
        let session = session(config, Arc::new(RecordingHooks::default()));

        session.validate_auth().await.unwrap();
        assert!(session.is_authed());

        // The rotated pair was persisted.
        let reloaded = TokenStore::new(&token_path);
        reloaded.load().unwrap();
        assert_eq!(reloaded.get().unwrap().access_token, "renewed-access");

        let hits = stub.hits();
        assert!(hits.iter().any(|r| r.contains("grant_type=refresh_token")));
    }

    #[tokio::test]
    async fn failed_renewal_settles_to_failed() {
        let stub = StubServer::identity_all_rejected().await;
        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("tokens.json");
        let store = TokenStore::new(&token_path);
        store
            .set(TokenPair::new("stale", Some("dead-refresh".to_string()), None))
            .unwrap();

        let config = BackendConfig::default()
            .with_callback_port(0)
            .with_token_path(&token_path)
            .without_browser()
            .into_stubbed(Some(stub.base.clone()), None);
        let session = session(config, Arc::new(RecordingHooks::default()));

        let err = session.validate_auth().await.unwrap_err();
        assert!(matches!(err, BackendError::SessionStale(_)));
        assert!(matches!(session.state(), AuthState::Failed { .. }));
        assert!(!session.is_authed());
    }

    #[tokio::test]
    async fn validate_without_tokens_is_not_authenticated() {
        let stub = StubServer::identity_ok().await;
        let (config, _dir) = test_config(&stub);
        let session = session(config, Arc::new(RecordingHooks::default()));

        let err = session.validate_auth().await.unwrap_err();
        assert!(matches!(err, BackendError::NotAuthenticated));
    }
}
