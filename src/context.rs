// Authenticated API context
// Owns the credential store, refresh coordination and the request pipeline

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{
    AccountService, AdminLogin, ExtensionPrompt, RefreshCoordinator, SessionExtensionCoordinator,
    TerminalPrompt, TokenStore,
};
use crate::config::Config;
use crate::dedup::DedupOptions;
use crate::events::EventBus;
use crate::heartbeat::{HeartbeatSettings, HeartbeatTracker};
use crate::http_client::{build_http_client, ApiClient};
use crate::progress::ProgressService;

/// Everything a caller needs to talk to the backend as one signed-in client.
///
/// Contexts are independent of each other; nothing here is process-global.
pub struct AuthContext {
    store: Arc<TokenStore>,
    events: EventBus,
    refresh: Arc<RefreshCoordinator>,
    extension: Option<Arc<SessionExtensionCoordinator>>,
    api: Arc<ApiClient>,
    /// Shared so concurrent initializations collapse onto one request
    progress: Arc<ProgressService>,
    /// The context's study session; one start guard per signed-in client
    heartbeat: Arc<HeartbeatTracker>,
}

impl AuthContext {
    /// Open the configured token store and prompt on the terminal when interactive
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store = TokenStore::open(&config.token_db_file).with_context(|| {
            format!(
                "Failed to open token store: {}",
                config.token_db_file.display()
            )
        })?;
        let prompt: Option<Arc<dyn ExtensionPrompt>> = if config.interactive_extension {
            Some(Arc::new(TerminalPrompt))
        } else {
            None
        };
        Self::new(config, store, prompt)
    }

    /// Build a context over an existing store; `prompt` enables interactive extension
    pub fn new(
        config: &Config,
        store: TokenStore,
        prompt: Option<Arc<dyn ExtensionPrompt>>,
    ) -> anyhow::Result<Self> {
        let client = build_http_client(
            config.http_max_connections,
            config.http_connect_timeout,
            config.http_request_timeout,
        )?;
        let store = Arc::new(store);
        let events = EventBus::default();

        let admin_login = match (&config.admin_username, &config.admin_password) {
            (Some(username), Some(password)) => Some(AdminLogin {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };

        let refresh = Arc::new(RefreshCoordinator::new(
            client.clone(),
            Arc::clone(&store),
            events.clone(),
            config.endpoints.clone(),
            config.refresh_threshold(),
            Duration::from_secs(config.http_request_timeout.saturating_add(5)),
            admin_login,
        ));

        let extension = prompt.map(|prompt| {
            Arc::new(SessionExtensionCoordinator::new(
                client.clone(),
                Arc::clone(&refresh),
                prompt,
                events.clone(),
            ))
        });

        let api = Arc::new(ApiClient::new(
            client,
            Arc::clone(&refresh),
            extension.clone(),
            config.endpoints.clone(),
        ));

        let init_options = DedupOptions::with_backoff(
            config.dedup_retry_count,
            Duration::from_millis(config.dedup_retry_delay_ms),
        )
        .ttl(Duration::from_secs(config.dedup_ttl));

        let progress = Arc::new(ProgressService::new(
            Arc::clone(&api),
            Arc::clone(&store),
            events.clone(),
            init_options,
        ));
        let heartbeat = Arc::new(HeartbeatTracker::new(
            Arc::clone(&api),
            events.clone(),
            config.heartbeat_settings(),
        ));

        tracing::debug!(
            base_url = %config.endpoints.base_url,
            interactive = extension.is_some(),
            "Auth context initialized"
        );

        Ok(Self {
            store,
            events,
            refresh,
            extension,
            api,
            progress,
            heartbeat,
        })
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn refresh(&self) -> &Arc<RefreshCoordinator> {
        &self.refresh
    }

    pub fn extension(&self) -> Option<&Arc<SessionExtensionCoordinator>> {
        self.extension.as_ref()
    }

    /// The request pipeline
    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    pub fn account(&self) -> AccountService {
        AccountService::new(Arc::clone(&self.api), Arc::clone(&self.refresh))
    }

    pub fn progress(&self) -> &Arc<ProgressService> {
        &self.progress
    }

    /// The context's heartbeat tracker; every caller sees the same session
    pub fn heartbeat_tracker(&self) -> &Arc<HeartbeatTracker> {
        &self.heartbeat
    }

    /// A separate tracker with its own session slot and start guard
    pub fn heartbeat_tracker_with(&self, settings: HeartbeatSettings) -> HeartbeatTracker {
        HeartbeatTracker::new(Arc::clone(&self.api), self.events.clone(), settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{CredentialScope, TokenPair};

    #[test]
    fn test_contexts_are_independent() {
        let config = Config::with_base_url("http://localhost:8080");
        let first = AuthContext::new(&config, TokenStore::in_memory().unwrap(), None).unwrap();
        let second = AuthContext::new(&config, TokenStore::in_memory().unwrap(), None).unwrap();

        first
            .store()
            .set(
                CredentialScope::User,
                TokenPair {
                    access_token: "a".to_string(),
                    refresh_token: None,
                },
            )
            .unwrap();

        assert!(first.store().get(CredentialScope::User).is_some());
        assert!(second.store().get(CredentialScope::User).is_none());
        assert!(first.extension().is_none());
    }

    #[test]
    fn test_heartbeat_settings_follow_config() {
        let mut config = Config::with_base_url("http://localhost:8080");
        config.heartbeat_interval = 15;
        let context = AuthContext::new(&config, TokenStore::in_memory().unwrap(), None).unwrap();

        let tracker = context.heartbeat_tracker();
        assert_eq!(tracker.settings().interval, Duration::from_secs(15));
    }

    #[test]
    fn test_services_are_shared_per_context() {
        let config = Config::with_base_url("http://localhost:8080");
        let context = AuthContext::new(&config, TokenStore::in_memory().unwrap(), None).unwrap();

        assert!(Arc::ptr_eq(context.progress(), context.progress()));
        assert!(Arc::ptr_eq(
            context.heartbeat_tracker(),
            context.heartbeat_tracker()
        ));
    }

    #[tokio::test]
    async fn test_concurrent_module_initialization_shares_one_request() {
        let mut server = mockito::Server::new_async().await;
        let init = server
            .mock("POST", "/progress/initialize")
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let context = AuthContext::new(
            &Config::with_base_url(&server.url()),
            TokenStore::in_memory().unwrap(),
            None,
        )
        .unwrap();
        context
            .store()
            .set(
                CredentialScope::User,
                TokenPair {
                    access_token: crate::auth::claims::test_token(Some(3600)),
                    refresh_token: Some("r-1".to_string()),
                },
            )
            .unwrap();

        let (first, second) = tokio::join!(
            context.progress().initialize_module("u", "c", "m"),
            context.progress().initialize_module("u", "c", "m")
        );
        assert!(first.is_ok());
        assert!(second.is_ok());
        init.assert_async().await;
    }
}
