// Integration tests for Session Guard
//
// These tests drive a full AuthContext against a mock backend: pipeline
// recovery, interactive extension, progress and heartbeat together.

use async_trait::async_trait;
use mockito::Matcher;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_test::{assert_err, assert_ok};

use session_guard::auth::{CredentialScope, ExtensionPrompt, TokenPair, TokenStore};
use session_guard::config::Config;
use session_guard::events::SessionEvent;
use session_guard::{ApiError, AuthContext};

// ==================================================================================================
// Test Helpers
// ==================================================================================================

/// Signed token expiring `expires_in` seconds from now
fn token(subject: &str, expires_in: i64) -> String {
    let claims = json!({
        "sub": subject,
        "exp": chrono::Utc::now().timestamp() + expires_in,
    });
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(b"integration"),
    )
    .expect("Failed to encode test token")
}

fn token_body(access: &str) -> String {
    json!({ "accessToken": access, "refreshToken": "r-2" }).to_string()
}

/// Context over an in-memory store seeded with `access` / `r-1`
fn create_test_context(
    server_url: &str,
    access: &str,
    prompt: Option<Arc<dyn ExtensionPrompt>>,
) -> Arc<AuthContext> {
    let mut config = Config::with_base_url(server_url);
    config.dedup_retry_delay_ms = 10;

    let store = TokenStore::in_memory().expect("Failed to create token store");
    store
        .set(
            CredentialScope::User,
            TokenPair {
                access_token: access.to_string(),
                refresh_token: Some("r-1".to_string()),
            },
        )
        .expect("Failed to seed credentials");

    Arc::new(AuthContext::new(&config, store, prompt).expect("Failed to create context"))
}

/// Prompt that answers once released
struct GatedPrompt {
    answer: bool,
    asked: AtomicUsize,
    gate: Notify,
}

impl GatedPrompt {
    fn new(answer: bool) -> Arc<Self> {
        Arc::new(Self {
            answer,
            asked: AtomicUsize::new(0),
            gate: Notify::new(),
        })
    }

    fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl ExtensionPrompt for GatedPrompt {
    async fn confirm_extension(&self) -> bool {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.gate.notified().await;
        self.answer
    }
}

async fn wait_for_queue(context: &AuthContext, expected: usize) {
    let extension = context.extension().expect("Extension coordinator missing");
    tokio::time::timeout(Duration::from_secs(5), async {
        while extension.queued() < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("Requests were not queued in time");
}

fn spawn_get(
    context: &Arc<AuthContext>,
    path: &'static str,
) -> tokio::task::JoinHandle<Result<String, ApiError>> {
    let api = Arc::clone(context.api());
    tokio::spawn(async move {
        let response = api.send(CredentialScope::User, api.get(path)).await?;
        response
            .text()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    })
}

// ==================================================================================================
// Request Pipeline
// ==================================================================================================

#[tokio::test]
async fn test_concurrent_401s_share_one_refresh() {
    let mut server = mockito::Server::new_async().await;
    let stale = token("learner", 3600);
    let fresh = token("learner", 7200);

    let rejected = server
        .mock("GET", "/lessons")
        .match_header("authorization", format!("Bearer {}", stale).as_str())
        .with_status(401)
        .expect_at_least(1)
        .create_async()
        .await;
    let accepted = server
        .mock("GET", "/lessons")
        .match_header("authorization", format!("Bearer {}", fresh).as_str())
        .with_status(200)
        .with_body("[]")
        .expect(5)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/auth/refresh")
        .match_body(Matcher::Json(json!({ "refreshToken": "r-1" })))
        .with_status(200)
        .with_body(token_body(&fresh))
        .expect(1)
        .create_async()
        .await;

    let context = create_test_context(&server.url(), &stale, None);

    let calls: Vec<_> = (0..5).map(|_| spawn_get(&context, "/lessons")).collect();
    for call in futures::future::join_all(calls).await {
        assert_eq!(call.unwrap().unwrap(), "[]");
    }

    rejected.assert_async().await;
    accepted.assert_async().await;
    refresh.assert_async().await;
    assert_eq!(
        context.store().refresh_token(CredentialScope::User).as_deref(),
        Some("r-2")
    );
}

#[tokio::test]
async fn test_server_errors_are_not_retried() {
    let mut server = mockito::Server::new_async().await;
    let lessons = server
        .mock("GET", "/lessons")
        .with_status(503)
        .expect(1)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/auth/refresh")
        .expect(0)
        .create_async()
        .await;

    let context = create_test_context(&server.url(), &token("learner", 3600), None);
    let api = context.api();

    let result = api.send(CredentialScope::User, api.get("/lessons")).await;
    let err = assert_err!(result);
    assert!(matches!(err, ApiError::Server { status: 503, .. }));

    lessons.assert_async().await;
    refresh.assert_async().await;
}

#[tokio::test]
async fn test_expired_refresh_material_redirects_to_login() {
    let mut server = mockito::Server::new_async().await;
    let _lessons = server
        .mock("GET", "/lessons")
        .with_status(401)
        .create_async()
        .await;
    let _refresh = server
        .mock("POST", "/auth/refresh")
        .with_status(401)
        .with_body("refresh token expired")
        .create_async()
        .await;

    let context = create_test_context(&server.url(), &token("learner", 3600), None);
    let mut events = context.events().subscribe();

    let err = spawn_get(&context, "/lessons").await.unwrap().unwrap_err();
    assert!(matches!(err, ApiError::SessionEnded(_)));
    assert!(context.store().tokens(CredentialScope::User).is_none());

    match events.recv().await.unwrap() {
        SessionEvent::LoginRequired { scope, .. } => assert_eq!(scope, CredentialScope::User),
        other => panic!("Unexpected event: {:?}", other),
    }
}

// ==================================================================================================
// Session Extension
// ==================================================================================================

#[tokio::test]
async fn test_extension_replays_queue_in_order() {
    let mut server = mockito::Server::new_async().await;
    let stale = token("learner", 3600);
    let fresh = token("learner", 7200);

    let _rejected = server
        .mock("GET", Matcher::Regex("^/(a|b|c)$".to_string()))
        .match_header("authorization", format!("Bearer {}", stale).as_str())
        .with_status(401)
        .create_async()
        .await;
    let replays = Arc::new(AtomicUsize::new(0));
    let order = Arc::clone(&replays);
    let accepted = server
        .mock("GET", Matcher::Regex("^/(a|b|c)$".to_string()))
        .match_header("authorization", format!("Bearer {}", fresh).as_str())
        .with_status(200)
        .with_body_from_request(move |request| {
            let position = order.fetch_add(1, Ordering::SeqCst);
            format!("{}:{}", request.path(), position).into_bytes()
        })
        .expect(3)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/auth/refresh")
        .with_status(200)
        .with_body(token_body(&fresh))
        .expect(1)
        .create_async()
        .await;

    let prompt = GatedPrompt::new(true);
    let context = create_test_context(&server.url(), &stale, Some(prompt.clone()));
    let mut events = context.events().subscribe();

    let a = spawn_get(&context, "/a");
    wait_for_queue(&context, 1).await;
    let b = spawn_get(&context, "/b");
    wait_for_queue(&context, 2).await;
    let c = spawn_get(&context, "/c");
    wait_for_queue(&context, 3).await;

    prompt.release();

    assert_eq!(a.await.unwrap().unwrap(), "/a:0");
    assert_eq!(b.await.unwrap().unwrap(), "/b:1");
    assert_eq!(c.await.unwrap().unwrap(), "/c:2");
    assert_eq!(prompt.asked.load(Ordering::SeqCst), 1);

    accepted.assert_async().await;
    refresh.assert_async().await;

    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::ExtensionRequested { queued: 1 }
    );
}

#[tokio::test]
async fn test_declined_extension_ends_session() {
    let mut server = mockito::Server::new_async().await;
    let _rejected = server
        .mock("GET", Matcher::Regex("^/(a|b)$".to_string()))
        .with_status(401)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/auth/refresh")
        .expect(0)
        .create_async()
        .await;

    let prompt = GatedPrompt::new(false);
    let context = create_test_context(&server.url(), &token("learner", 3600), Some(prompt.clone()));
    let mut events = context.events().subscribe();

    let a = spawn_get(&context, "/a");
    wait_for_queue(&context, 1).await;
    let b = spawn_get(&context, "/b");
    wait_for_queue(&context, 2).await;
    prompt.release();

    assert!(matches!(a.await.unwrap(), Err(ApiError::SessionEnded(_))));
    assert!(matches!(b.await.unwrap(), Err(ApiError::SessionEnded(_))));
    assert!(context.store().get(CredentialScope::User).is_none());
    refresh.assert_async().await;

    let mut saw_login_required = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SessionEvent::LoginRequired { .. }) {
            saw_login_required = true;
        }
    }
    assert!(saw_login_required);
}

#[tokio::test]
async fn test_late_401_after_extension_does_not_prompt_again() {
    let mut server = mockito::Server::new_async().await;
    let stale = token("learner", 3600);
    let fresh = token("learner", 7200);

    let prompt = GatedPrompt::new(true);
    let context = create_test_context(&server.url(), &stale, Some(prompt.clone()));

    // The 401 for the stale credential lands after the credential was extended
    let store = Arc::clone(context.store());
    let extended = fresh.clone();
    let rejected = server
        .mock("GET", "/slow")
        .match_header("authorization", format!("Bearer {}", stale).as_str())
        .with_status(401)
        .with_body_from_request(move |_| {
            store
                .set(
                    CredentialScope::User,
                    TokenPair {
                        access_token: extended.clone(),
                        refresh_token: Some("r-2".to_string()),
                    },
                )
                .expect("Failed to store extended credentials");
            Vec::new()
        })
        .expect(1)
        .create_async()
        .await;
    let accepted = server
        .mock("GET", "/slow")
        .match_header("authorization", format!("Bearer {}", fresh).as_str())
        .with_status(200)
        .with_body("done")
        .expect(1)
        .create_async()
        .await;
    let refresh = server
        .mock("POST", "/auth/refresh")
        .expect(0)
        .create_async()
        .await;

    assert_eq!(spawn_get(&context, "/slow").await.unwrap().unwrap(), "done");
    assert_eq!(prompt.asked.load(Ordering::SeqCst), 0);
    assert_eq!(context.extension().map(|e| e.queued()), Some(0));

    rejected.assert_async().await;
    accepted.assert_async().await;
    refresh.assert_async().await;
}

// ==================================================================================================
// Progress
// ==================================================================================================

#[tokio::test]
async fn test_module_initialization_once_per_user() {
    let mut server = mockito::Server::new_async().await;
    let init = server
        .mock("POST", "/progress/initialize")
        .match_header("x-user-id", "learner")
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let context = create_test_context(&server.url(), &token("learner", 3600), None);
    let progress = Arc::clone(context.progress());

    let calls: Vec<_> = (0..3)
        .map(|_| {
            let progress = Arc::clone(&progress);
            tokio::spawn(async move { progress.initialize_module("learner", "c-1", "m-1").await })
        })
        .collect();
    for call in futures::future::join_all(calls).await {
        assert_ok!(call.unwrap());
    }

    // Later calls are answered from the cached flag
    assert_ok!(
        context
            .progress()
            .initialize_module("learner", "c-1", "m-1")
            .await
    );
    assert!(context
        .store()
        .has_flag("module-initialized:learner:c-1:m-1"));
    init.assert_async().await;
}

#[tokio::test]
async fn test_completed_items_never_block_on_failure() {
    // Nothing listens here
    let context = create_test_context("http://127.0.0.1:1", &token("learner", 3600), None);
    assert!(context
        .progress()
        .completed_items("learner", "c-1")
        .await
        .is_empty());
}

// ==================================================================================================
// Heartbeat
// ==================================================================================================

#[tokio::test]
async fn test_heartbeat_recovers_from_401() {
    let mut server = mockito::Server::new_async().await;
    let stale = token("learner", 3600);
    let fresh = token("learner", 7200);

    let _start = server
        .mock("POST", "/sessions/start")
        .with_status(200)
        .with_body(r#"{"sessionId":"s-1"}"#)
        .create_async()
        .await;
    let _rejected = server
        .mock("POST", "/sessions/heartbeat")
        .match_header("authorization", format!("Bearer {}", stale).as_str())
        .with_status(401)
        .create_async()
        .await;
    let accepted = server
        .mock("POST", "/sessions/heartbeat")
        .match_header("authorization", format!("Bearer {}", fresh).as_str())
        .with_status(204)
        .expect(1)
        .create_async()
        .await;
    let _refresh = server
        .mock("POST", "/auth/refresh")
        .with_status(200)
        .with_body(token_body(&fresh))
        .create_async()
        .await;

    let context = create_test_context(&server.url(), &stale, None);
    let tracker = context.heartbeat_tracker();

    tracker.start("c-1", "m-1", "l-1").await.unwrap();
    assert_ok!(tracker.heartbeat().await);
    accepted.assert_async().await;
}

// ==================================================================================================
// Persistence
// ==================================================================================================

#[tokio::test]
async fn test_login_survives_restart() {
    let mut server = mockito::Server::new_async().await;
    let access = token("learner", 3600);
    let _login = server
        .mock("POST", "/auth/login")
        .with_status(200)
        .with_body(token_body(&access))
        .create_async()
        .await;

    let dir = std::env::temp_dir().join(format!("session-guard-{}", uuid::Uuid::new_v4()));
    let mut config = Config::with_base_url(&server.url());
    config.token_db_file = dir.join("tokens.sqlite3");
    config.interactive_extension = false;

    {
        let context = AuthContext::from_config(&config).unwrap();
        context.account().login("learner", "secret").await.unwrap();
    }

    let context = AuthContext::from_config(&config).unwrap();
    let credential = context.store().get(CredentialScope::User).unwrap();
    assert_eq!(credential.value, access);
    assert!(context.extension().is_none());

    let _ = std::fs::remove_dir_all(dir);
}
