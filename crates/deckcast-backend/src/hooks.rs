//! Collaborator callbacks.
//!
//! The host process (configuration UI, action widgets) hears back from the
//! core through this trait instead of stored method references, so the
//! session and the listener never hold each other alive.

/// Callbacks the core fires toward its host.
///
/// Implementations must be cheap and non-blocking; they are invoked from the
/// authorization task.
pub trait BackendHooks: Send + Sync {
    /// The outcome of an authorization attempt, with a displayable message.
    fn on_auth_result(&self, success: bool, message: &str);

    /// A credential triple that completed an exchange; fired once per
    /// successful exchange so the host can persist it.
    fn on_credentials_validated(&self, client_id: &str, client_secret: &str, authorization_code: &str);
}

/// Hooks that ignore every callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl BackendHooks for NoopHooks {
    fn on_auth_result(&self, _success: bool, _message: &str) {}

    fn on_credentials_validated(&self, _client_id: &str, _client_secret: &str, _authorization_code: &str) {
    }
}
