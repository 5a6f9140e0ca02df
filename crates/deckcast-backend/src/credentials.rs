//! Application credential storage.

/// The credential triple driving the authorization flow.
///
/// Plain data; the session guards it with its own locks. The client id and
/// secret arrive from the collaborator, the authorization code from a
/// completed redirect. Persistence is the collaborator's job, via the
/// credentials-validated hook.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    client_id: String,
    client_secret: String,
    authorization_code: String,
}

impl CredentialStore {
    /// Returns the client id.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Returns the client secret.
    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// Returns the last authorization code received from a redirect.
    pub fn authorization_code(&self) -> &str {
        &self.authorization_code
    }

    /// Stores a new client id/secret pair.
    pub fn set_client_pair(&mut self, client_id: impl Into<String>, client_secret: impl Into<String>) {
        self.client_id = client_id.into();
        self.client_secret = client_secret.into();
    }

    /// Stores the authorization code from a successful redirect.
    pub fn set_authorization_code(&mut self, code: impl Into<String>) {
        self.authorization_code = code.into();
    }

    /// Returns true if both the client id and secret are set.
    pub fn has_client_pair(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }
}
