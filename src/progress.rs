// Lesson and module progress tracking
// Completion reads degrade to empty results; writes go to the backend

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::{CredentialScope, TokenStore};
use crate::dedup::{DedupOptions, Deduplicator};
use crate::error::Result;
use crate::events::{EventBus, SessionEvent};
use crate::http_client::{ApiClient, USER_ID_HEADER};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedItem {
    pub item_id: String,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitializeRequest<'a> {
    course_id: &'a str,
    module_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteRequest<'a> {
    course_id: &'a str,
    module_id: &'a str,
    lesson_id: &'a str,
}

pub struct ProgressService {
    api: Arc<ApiClient>,
    store: Arc<TokenStore>,
    events: EventBus,
    init: Deduplicator<()>,
    /// Retry policy for module initialization
    init_options: DedupOptions,
}

impl ProgressService {
    pub fn new(
        api: Arc<ApiClient>,
        store: Arc<TokenStore>,
        events: EventBus,
        init_options: DedupOptions,
    ) -> Self {
        Self {
            api,
            store,
            events,
            init: Deduplicator::new(),
            init_options,
        }
    }

    /// Initialize progress records for a module once per user.
    ///
    /// Concurrent calls for the same module share one backend call, and a
    /// module already initialized on this device is skipped.
    pub async fn initialize_module(
        &self,
        user_id: &str,
        course_id: &str,
        module_id: &str,
    ) -> Result<()> {
        let flag = format!("module-initialized:{}:{}:{}", user_id, course_id, module_id);
        if self.store.has_flag(&flag) {
            tracing::debug!(course_id = %course_id, module_id = %module_id, "Module already initialized");
            return Ok(());
        }

        let api = Arc::clone(&self.api);
        let (user, course, module) = (
            user_id.to_string(),
            course_id.to_string(),
            module_id.to_string(),
        );
        let key = format!("init:{}:{}:{}", user_id, course_id, module_id);

        self.init
            .run(
                key,
                move || {
                    let api = Arc::clone(&api);
                    let (user, course, module) = (user.clone(), course.clone(), module.clone());
                    async move {
                        let body = InitializeRequest {
                            course_id: &course,
                            module_id: &module,
                        };
                        let builder = api
                            .post(&api.endpoints().progress_initialize())
                            .header(USER_ID_HEADER, user.as_str())
                            .json(&body);
                        api.send(CredentialScope::User, builder).await?;
                        Ok(())
                    }
                },
                self.init_options,
            )
            .await?;

        if let Err(e) = self.store.set_flag(&flag, &Utc::now().to_rfc3339()) {
            tracing::warn!(flag = %flag, error = %e, "Failed to cache module initialization");
        }
        tracing::info!(course_id = %course_id, module_id = %module_id, "Module progress initialized");
        self.events.publish(SessionEvent::ModuleInitialized {
            course_id: course_id.to_string(),
            module_id: module_id.to_string(),
        });
        Ok(())
    }

    /// Completed items of a course; failures yield an empty list
    pub async fn completed_items(&self, user_id: &str, course_id: &str) -> Vec<CompletedItem> {
        let builder = self
            .api
            .get(&self.api.endpoints().progress_completed())
            .header(USER_ID_HEADER, user_id)
            .query(&[("courseId", course_id)]);

        match self
            .api
            .send_json::<Vec<CompletedItem>>(CredentialScope::User, builder)
            .await
        {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(course_id = %course_id, error = %e, "Failed to load completed items, showing none");
                Vec::new()
            }
        }
    }

    pub async fn mark_complete(
        &self,
        user_id: &str,
        course_id: &str,
        module_id: &str,
        lesson_id: &str,
    ) -> Result<()> {
        let body = CompleteRequest {
            course_id,
            module_id,
            lesson_id,
        };
        let builder = self
            .api
            .post(&self.api.endpoints().progress_complete())
            .header(USER_ID_HEADER, user_id)
            .json(&body);
        self.api.send(CredentialScope::User, builder).await?;

        tracing::info!(course_id = %course_id, lesson_id = %lesson_id, "Lesson marked complete");
        self.events.publish(SessionEvent::ItemCompleted {
            course_id: course_id.to_string(),
            lesson_id: lesson_id.to_string(),
        });
        Ok(())
    }

    /// Local-only: nothing is recorded remotely
    pub fn mark_incomplete(&self, course_id: &str, lesson_id: &str) {
        tracing::debug!(course_id = %course_id, lesson_id = %lesson_id, "Lesson marked incomplete locally");
        self.events.publish(SessionEvent::ItemMarkedIncomplete {
            course_id: course_id.to_string(),
            lesson_id: lesson_id.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::claims::test_token;
    use crate::auth::{RefreshCoordinator, TokenPair};
    use crate::config::EndpointConfig;
    use crate::error::ApiError;
    use mockito::Matcher;
    use reqwest::Client;
    use std::time::Duration;

    fn service(server_url: &str, init_options: DedupOptions) -> (Arc<ProgressService>, EventBus) {
        let client = Client::new();
        let events = EventBus::default();
        let store = Arc::new(TokenStore::in_memory().unwrap());
        store
            .set(
                CredentialScope::User,
                TokenPair {
                    access_token: test_token(Some(3600)),
                    refresh_token: Some("r-1".to_string()),
                },
            )
            .unwrap();
        let endpoints = EndpointConfig::new(server_url);
        let refresh = Arc::new(RefreshCoordinator::new(
            client.clone(),
            Arc::clone(&store),
            events.clone(),
            endpoints.clone(),
            Duration::from_secs(300),
            Duration::from_secs(5),
            None,
        ));
        let api = Arc::new(ApiClient::new(client, refresh, None, endpoints));
        let service = Arc::new(ProgressService::new(api, store, events.clone(), init_options));
        (service, events)
    }

    #[tokio::test]
    async fn test_concurrent_initialization_is_deduplicated() {
        let mut server = mockito::Server::new_async().await;
        let init = server
            .mock("POST", "/progress/initialize")
            .match_header("x-user-id", "u-1")
            .match_body(Matcher::Json(serde_json::json!({
                "courseId": "c-1",
                "moduleId": "m-1"
            })))
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let (service, events) = service(&server.url(), DedupOptions::default());
        let mut observer = events.subscribe();

        let calls = (0..4).map(|_| {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.initialize_module("u-1", "c-1", "m-1").await })
        });
        for result in futures::future::join_all(calls).await {
            result.unwrap().unwrap();
        }

        // Cached flag short-circuits later calls
        service.initialize_module("u-1", "c-1", "m-1").await.unwrap();
        init.assert_async().await;

        assert_eq!(
            observer.recv().await.unwrap(),
            SessionEvent::ModuleInitialized {
                course_id: "c-1".to_string(),
                module_id: "m-1".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_initialization_retries_with_backoff() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/progress/initialize")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let options = DedupOptions::with_backoff(2, Duration::from_millis(10));
        let (service, _events) = service(&server.url(), options);

        let err = service
            .initialize_module("u-1", "c-1", "m-1")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Server { status: 503, .. }));
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn test_completed_items_degrade_to_empty() {
        let mut server = mockito::Server::new_async().await;
        let _completed = server
            .mock("GET", "/progress/completed")
            .match_query(Matcher::UrlEncoded("courseId".into(), "c-1".into()))
            .with_status(500)
            .create_async()
            .await;

        let (service, _events) = service(&server.url(), DedupOptions::default());
        assert!(service.completed_items("u-1", "c-1").await.is_empty());
    }

    #[tokio::test]
    async fn test_completed_items_parsed() {
        let mut server = mockito::Server::new_async().await;
        let _completed = server
            .mock("GET", "/progress/completed")
            .match_query(Matcher::UrlEncoded("courseId".into(), "c-1".into()))
            .with_status(200)
            .with_body(r#"[{"itemId":"l-1","completedAt":"2026-03-01T10:00:00Z"},{"itemId":"l-2"}]"#)
            .create_async()
            .await;

        let (service, _events) = service(&server.url(), DedupOptions::default());
        let items = service.completed_items("u-1", "c-1").await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].item_id, "l-1");
        assert!(items[0].completed_at.is_some());
        assert_eq!(items[1].completed_at, None);
    }

    #[tokio::test]
    async fn test_mark_complete_propagates_errors() {
        let mut server = mockito::Server::new_async().await;
        let _complete = server
            .mock("POST", "/progress/complete")
            .with_status(422)
            .with_body("lesson not started")
            .create_async()
            .await;

        let (service, events) = service(&server.url(), DedupOptions::default());
        let mut observer = events.subscribe();

        let err = service
            .mark_complete("u-1", "c-1", "m-1", "l-1")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation { status: 422, .. }));
        assert!(observer.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_mark_incomplete_is_local_only() {
        let mut server = mockito::Server::new_async().await;
        let remote = server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let (service, events) = service(&server.url(), DedupOptions::default());
        let mut observer = events.subscribe();

        service.mark_incomplete("c-1", "l-1");
        assert_eq!(
            observer.recv().await.unwrap(),
            SessionEvent::ItemMarkedIncomplete {
                course_id: "c-1".to_string(),
                lesson_id: "l-1".to_string(),
            }
        );
        remote.assert_async().await;
    }
}
