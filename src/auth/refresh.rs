// Single-flight credential refresh
// One refresh per scope in flight; every concurrent caller shares its outcome

use reqwest::Client;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::store::TokenStore;
use super::types::{Credential, CredentialScope, LoginRequest, RefreshRequest, TokenPair};
use crate::config::EndpointConfig;
use crate::dedup::{DedupOptions, Deduplicator};
use crate::error::{ApiError, Result};
use crate::events::{EventBus, SessionEvent};

/// Service account used to acquire admin-scope credentials
#[derive(Clone)]
pub struct AdminLogin {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for AdminLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminLogin")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Refresh coordinator
/// Hands out valid credentials per scope, refreshing at most once at a time
pub struct RefreshCoordinator {
    /// HTTP client for login/refresh requests
    client: Client,

    store: Arc<TokenStore>,

    events: EventBus,

    endpoints: EndpointConfig,

    /// In-flight refresh per scope, keyed `refresh:<scope>`
    inflight: Deduplicator<Credential>,

    /// Credentials expiring within this window are refreshed proactively
    refresh_threshold: Duration,

    /// Ceiling for a hung refresh call
    refresh_ttl: Duration,

    admin_login: Option<AdminLogin>,
}

impl RefreshCoordinator {
    pub fn new(
        client: Client,
        store: Arc<TokenStore>,
        events: EventBus,
        endpoints: EndpointConfig,
        refresh_threshold: Duration,
        refresh_ttl: Duration,
        admin_login: Option<AdminLogin>,
    ) -> Self {
        Self {
            client,
            store,
            events,
            endpoints,
            inflight: Deduplicator::new(),
            refresh_threshold,
            refresh_ttl,
            admin_login,
        }
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn refresh_threshold(&self) -> Duration {
        self.refresh_threshold
    }

    /// Get a valid credential for the scope, refreshing if necessary.
    ///
    /// With `force` the cached credential is ignored. Concurrent callers
    /// join the same refresh; a failed refresh is not retried here.
    pub async fn get_valid_credential(
        self: &Arc<Self>,
        scope: CredentialScope,
        force: bool,
    ) -> Result<Credential> {
        if !force {
            if let Some(credential) = self.store.get(scope) {
                if !credential.will_expire_soon(self.refresh_threshold) {
                    return Ok(credential);
                }
                tracing::debug!(scope = %scope, "Credential expiring soon, refreshing");
            }
        }

        let this = Arc::clone(self);
        let options = DedupOptions::default().ttl(self.refresh_ttl);
        self.inflight
            .run(
                format!("refresh:{}", scope),
                move || {
                    let this = Arc::clone(&this);
                    async move { this.perform_refresh(scope).await }
                },
                options,
            )
            .await
    }

    /// Recover from a 401 received while presenting `rejected`.
    ///
    /// When another caller already replaced the rejected credential the
    /// current one is reused instead of refreshing again.
    pub async fn refresh_after_rejection(
        self: &Arc<Self>,
        scope: CredentialScope,
        rejected: Option<&str>,
    ) -> Result<Credential> {
        if let Some(current) = self.replacement_for(scope, rejected) {
            tracing::debug!(scope = %scope, "Credential already refreshed by another caller");
            return Ok(current);
        }

        self.get_valid_credential(scope, true).await
    }

    /// Stored credential that has replaced `rejected` and is still usable
    pub(crate) fn replacement_for(
        &self,
        scope: CredentialScope,
        rejected: Option<&str>,
    ) -> Option<Credential> {
        let rejected = rejected?;
        self.store
            .get(scope)
            .filter(|current| current.value != rejected && !current.is_expired())
    }

    /// Exchange username/password for credentials and persist them
    pub async fn login(
        &self,
        scope: CredentialScope,
        username: &str,
        password: &str,
    ) -> Result<Credential> {
        tracing::info!(scope = %scope, username = %username, "Logging in");

        let pair = self.request_login(username, password).await?;
        self.store_tokens(scope, pair)
    }

    /// Clear the scope's credentials and send the client back to login
    pub fn logout(&self, scope: CredentialScope, reason: &str) {
        tracing::warn!(scope = %scope, reason = %reason, "Clearing credentials");

        if let Err(e) = self.store.clear(scope) {
            tracing::error!(scope = %scope, error = %e, "Failed to clear persisted credentials");
        }

        self.events.publish(SessionEvent::LoginRequired {
            scope,
            reason: reason.to_string(),
        });
    }

    async fn perform_refresh(&self, scope: CredentialScope) -> Result<Credential> {
        let refresh_token = self.store.refresh_token(scope);

        let pair = match (scope, refresh_token) {
            (CredentialScope::User, Some(token)) => self.request_refresh(&token).await?,
            (CredentialScope::User, None) => return Err(ApiError::MissingRefreshToken(scope)),
            (CredentialScope::Admin, Some(token)) => match self.request_refresh(&token).await {
                Ok(pair) => pair,
                Err(e) if e.is_credential_rejected() && self.admin_login.is_some() => {
                    tracing::warn!(error = %e, "Admin refresh rejected, acquiring new credentials");
                    self.acquire_admin().await?
                }
                Err(e) => return Err(e),
            },
            (CredentialScope::Admin, None) => self.acquire_admin().await?,
        };

        self.store_tokens(scope, pair)
    }

    /// Initial login-like acquisition for the admin service identity
    async fn acquire_admin(&self) -> Result<TokenPair> {
        let admin = self
            .admin_login
            .as_ref()
            .ok_or(ApiError::MissingRefreshToken(CredentialScope::Admin))?;

        tracing::info!(username = %admin.username, "Acquiring admin credentials");
        self.request_login(&admin.username, &admin.password).await
    }

    fn store_tokens(&self, scope: CredentialScope, mut pair: TokenPair) -> Result<Credential> {
        // Keep the previous refresh material when the backend does not rotate it
        if pair.refresh_token.is_none() {
            pair.refresh_token = self.store.refresh_token(scope);
        }

        let credential = Credential::from_token(pair.access_token.clone());
        self.store.set(scope, pair)?;

        match credential.expires_at {
            Some(exp) => tracing::info!(
                scope = %scope,
                token = %credential.redacted(),
                "Credential refreshed, expires: {}",
                exp.to_rfc3339()
            ),
            None => tracing::warn!(
                scope = %scope,
                token = %credential.redacted(),
                "Credential refreshed but carries no readable expiry"
            ),
        }

        self.events.publish(SessionEvent::CredentialRefreshed { scope });
        Ok(credential)
    }

    async fn request_refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let url = self.endpoints.url(&self.endpoints.refresh());
        tracing::debug!(url = %url, "Sending refresh request");

        let response = self
            .client
            .post(&url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(&e))?;

        parse_token_response(response, "refresh").await
    }

    async fn request_login(&self, username: &str, password: &str) -> Result<TokenPair> {
        let url = self.endpoints.url(&self.endpoints.login());

        let response = self
            .client
            .post(&url)
            .json(&LoginRequest { username, password })
            .send()
            .await
            .map_err(|e| ApiError::from_reqwest(&e))?;

        parse_token_response(response, "login").await
    }
}

async fn parse_token_response(response: reqwest::Response, operation: &str) -> Result<TokenPair> {
    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        tracing::error!(
            status = %status,
            body = %error_text,
            "Credential {} failed",
            operation
        );
        return Err(ApiError::from_status(status, error_text));
    }

    let pair: TokenPair = response
        .json()
        .await
        .map_err(|e| ApiError::Decode(format!("Failed to parse {} response: {}", operation, e)))?;

    if pair.access_token.is_empty() {
        return Err(ApiError::Decode(format!(
            "{} response does not contain accessToken",
            operation
        )));
    }

    Ok(pair)
}
