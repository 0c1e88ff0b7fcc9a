use anyhow::Context;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, Request, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{Credential, CredentialScope, RefreshCoordinator, SessionExtensionCoordinator};
use crate::config::EndpointConfig;
use crate::error::{ApiError, Result};

/// Header identifying the caller out-of-band of the bearer token
pub const USER_ID_HEADER: &str = "X-User-Id";

/// Build the shared HTTP client with connection pooling
pub fn build_http_client(
    max_connections: usize,
    connect_timeout: u64,
    request_timeout: u64,
) -> anyhow::Result<Client> {
    Client::builder()
        .pool_max_idle_per_host(max_connections)
        .connect_timeout(Duration::from_secs(connect_timeout))
        .timeout(Duration::from_secs(request_timeout))
        .user_agent(format!(
            "session-guard/{}-{}",
            env!("CARGO_PKG_VERSION"),
            client_fingerprint()
        ))
        .build()
        .context("Failed to create HTTP client")
}

/// Get machine fingerprint for User-Agent
fn client_fingerprint() -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let mut hasher = DefaultHasher::new();
    hostname.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Per-call interceptor chain for the backend API
///
/// Attaches credentials, classifies responses and recovers from 401:
/// - interactive: hands the call to the session extension coordinator
/// - otherwise: one silent refresh and a single replay
/// - 5xx and network failures are surfaced immediately, never retried
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    refresh: Arc<RefreshCoordinator>,

    /// Present when session extension needs user confirmation
    extension: Option<Arc<SessionExtensionCoordinator>>,

    endpoints: EndpointConfig,
}

impl ApiClient {
    pub fn new(
        client: Client,
        refresh: Arc<RefreshCoordinator>,
        extension: Option<Arc<SessionExtensionCoordinator>>,
        endpoints: EndpointConfig,
    ) -> Self {
        Self {
            client,
            refresh,
            extension,
            endpoints,
        }
    }

    pub fn endpoints(&self) -> &EndpointConfig {
        &self.endpoints
    }

    /// Start a request to a backend path
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, self.endpoints.url(path))
    }

    pub fn get(&self, path: &str) -> RequestBuilder {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: &str) -> RequestBuilder {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: &str) -> RequestBuilder {
        self.request(Method::PUT, path)
    }

    /// Build and execute a request for the scope
    pub async fn send(&self, scope: CredentialScope, builder: RequestBuilder) -> Result<Response> {
        let request = builder.build().map_err(|e| ApiError::from_reqwest(&e))?;
        self.execute(scope, request).await
    }

    /// Execute and decode a JSON response body
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        scope: CredentialScope,
        builder: RequestBuilder,
    ) -> Result<T> {
        let response = self.send(scope, builder).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(format!("Failed to parse response body: {}", e)))
    }

    /// Execute a request, recovering once from 401
    pub async fn execute(&self, scope: CredentialScope, request: Request) -> Result<Response> {
        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let method = request.method().clone();
        let url = request.url().clone();
        let auth_endpoint = self.endpoints.is_auth_endpoint(url.path());

        tracing::debug!(
            request_id = %request_id,
            method = %method,
            url = %url,
            scope = %scope,
            "Sending HTTP request"
        );

        // Single recovery per call
        let mut retried = false;

        loop {
            // Clone the request for this attempt
            let mut attempt = request.try_clone().ok_or_else(|| {
                ApiError::Internal("Request body is not cloneable".to_string())
            })?;

            let credential = if auth_endpoint {
                None
            } else {
                self.current_credential(scope).await
            };
            if let Some(ref credential) = credential {
                attach_bearer(&mut attempt, credential)?;
            }

            let response = match self.client.execute(attempt).await {
                Ok(response) => response,
                Err(e) => {
                    let error = ApiError::from_reqwest(&e);
                    tracing::warn!(
                        request_id = %request_id,
                        url = %url,
                        error = %error,
                        "HTTP request error"
                    );
                    return Err(error);
                }
            };

            let status = response.status();
            tracing::debug!(request_id = %request_id, status = %status, "Received HTTP response");

            if status.is_success() {
                return Ok(response);
            }

            if status != StatusCode::UNAUTHORIZED || auth_endpoint || retried {
                return Err(error_from_response(response).await);
            }

            retried = true;
            tracing::warn!(request_id = %request_id, scope = %scope, "Received 401, recovering credentials");

            let rejected = credential.as_ref().map(|c| c.value.as_str());

            // Without refresh material there is nothing to confirm
            if scope == CredentialScope::User
                && self.refresh.store().refresh_token(scope).is_some()
            {
                if let Some(extension) = &self.extension {
                    return extension.enqueue(scope, request, rejected).await;
                }
            }

            match self.refresh.refresh_after_rejection(scope, rejected).await {
                Ok(_) => {
                    tracing::debug!(request_id = %request_id, "Replaying request with refreshed credential");
                    continue;
                }
                Err(e) if e.is_credential_rejected() => {
                    tracing::error!(request_id = %request_id, error = %e, "Credential recovery failed");
                    self.refresh.logout(scope, "credential refresh rejected");
                    return Err(ApiError::SessionEnded(e.to_string()));
                }
                Err(e) => {
                    tracing::error!(request_id = %request_id, error = %e, "Credential refresh unavailable");
                    return Err(e);
                }
            }
        }
    }

    /// Valid credential for the scope; falls back to the stored one when a proactive refresh fails
    async fn current_credential(&self, scope: CredentialScope) -> Option<Credential> {
        match self.refresh.get_valid_credential(scope, false).await {
            Ok(credential) => Some(credential),
            Err(e) => {
                tracing::debug!(scope = %scope, error = %e, "Proactive refresh failed, using stored credential");
                self.refresh.store().get(scope)
            }
        }
    }
}

/// Set `Authorization: Bearer <token>` on a request, replacing any previous value
pub(crate) fn attach_bearer(request: &mut Request, credential: &Credential) -> Result<()> {
    let value = HeaderValue::from_str(&credential.bearer())
        .map_err(|e| ApiError::Internal(format!("Invalid credential header: {}", e)))?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(())
}

/// Consume a non-success response into its classified error
pub(crate) async fn error_from_response(response: Response) -> ApiError {
    let status = response.status();
    let url = response.url().clone();
    let error_text = response.text().await.unwrap_or_default();

    if status.is_server_error() {
        tracing::error!(
            status = status.as_u16(),
            url = %url,
            response_body = %error_text,
            "HTTP request failed with server error"
        );
    } else {
        tracing::warn!(
            status = status.as_u16(),
            url = %url,
            response_body = %error_text,
            "HTTP request failed with error response"
        );
    }

    ApiError::from_status(status, error_text)
}
