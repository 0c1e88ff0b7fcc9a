// Interactive session extension
// Holds 401-blocked requests while the user decides whether to stay signed in

use async_trait::async_trait;
use reqwest::{Client, Request, Response};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

use super::refresh::RefreshCoordinator;
use super::types::{Credential, CredentialScope};
use crate::error::{ApiError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::http_client::{attach_bearer, error_from_response};

/// Source of the user's answer to "extend your session?"
#[async_trait]
pub trait ExtensionPrompt: Send + Sync {
    async fn confirm_extension(&self) -> bool;
}

/// Prompt on the controlling terminal
pub struct TerminalPrompt;

#[async_trait]
impl ExtensionPrompt for TerminalPrompt {
    async fn confirm_extension(&self) -> bool {
        let answer = tokio::task::spawn_blocking(|| {
            dialoguer::Confirm::new()
                .with_prompt("Your session has expired. Extend it?")
                .default(true)
                .interact()
        })
        .await;

        match answer {
            Ok(Ok(confirmed)) => confirmed,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Extension prompt failed, treating as declined");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Extension prompt task failed, treating as declined");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionState {
    Idle,
    AwaitingUserDecision,
    Extending,
    LoggingOut,
}

/// A blocked call; its responder is consumed exactly once
struct PendingRequest {
    request: Request,
    responder: oneshot::Sender<Result<Response>>,
}

/// What a newly rejected request does next
enum Admission {
    Replay(Request, Credential),
    Prompt(usize),
    Queued,
}

struct Inner {
    state: ExtensionState,
    queue: VecDeque<PendingRequest>,
}

pub struct SessionExtensionCoordinator {
    client: Client,
    refresh: Arc<RefreshCoordinator>,
    prompt: Arc<dyn ExtensionPrompt>,
    events: EventBus,
    inner: Mutex<Inner>,
}

impl SessionExtensionCoordinator {
    pub fn new(
        client: Client,
        refresh: Arc<RefreshCoordinator>,
        prompt: Arc<dyn ExtensionPrompt>,
        events: EventBus,
    ) -> Self {
        Self {
            client,
            refresh,
            prompt,
            events,
            inner: Mutex::new(Inner {
                state: ExtensionState::Idle,
                queue: VecDeque::new(),
            }),
        }
    }

    pub fn state(&self) -> ExtensionState {
        self.lock().state
    }

    /// Number of requests waiting for the decision
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Suspend a rejected request until the extension decision is made.
    ///
    /// The first request while idle triggers the prompt; later ones join
    /// the queue without prompting again. A 401 for a credential that an
    /// earlier extension already replaced is replayed straight away.
    pub(crate) async fn enqueue(
        self: &Arc<Self>,
        scope: CredentialScope,
        request: Request,
        rejected: Option<&str>,
    ) -> Result<Response> {
        let (responder, receiver) = oneshot::channel();

        let admission = {
            let mut inner = self.lock();
            let replacement = if inner.state == ExtensionState::Idle {
                self.refresh.replacement_for(scope, rejected)
            } else {
                None
            };

            match replacement {
                Some(credential) => Admission::Replay(request, credential),
                None => {
                    inner.queue.push_back(PendingRequest { request, responder });
                    tracing::debug!(queued = inner.queue.len(), state = ?inner.state, "Request queued for session extension");

                    if inner.state == ExtensionState::Idle {
                        inner.state = ExtensionState::AwaitingUserDecision;
                        Admission::Prompt(inner.queue.len())
                    } else {
                        Admission::Queued
                    }
                }
            }
        };

        match admission {
            Admission::Replay(mut request, credential) => {
                tracing::debug!(credential = %credential.redacted(), "Late 401 for a replaced credential, replaying");
                attach_bearer(&mut request, &credential)?;
                return self.replay(request).await;
            }
            Admission::Prompt(queued) => {
                self.events
                    .publish(SessionEvent::ExtensionRequested { queued });
                let this = Arc::clone(self);
                tokio::spawn(async move { this.resolve(scope).await });
            }
            Admission::Queued => {}
        }

        receiver
            .await
            .unwrap_or_else(|_| Err(ApiError::SessionEnded("request dropped".to_string())))
    }

    async fn resolve(self: Arc<Self>, scope: CredentialScope) {
        let confirmed = self.prompt.confirm_extension().await;
        tracing::info!(confirmed = confirmed, "Session extension decision received");

        if confirmed {
            self.set_state(ExtensionState::Extending);
            match self.refresh.get_valid_credential(scope, true).await {
                Ok(credential) => {
                    self.events
                        .publish(SessionEvent::ExtensionResolved { extended: true });
                    self.replay_queue(&credential).await;
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Session extension failed");
                }
            }
        }

        self.set_state(ExtensionState::LoggingOut);
        self.events
            .publish(SessionEvent::ExtensionResolved { extended: false });
        self.refresh.logout(scope, "session extension declined or failed");

        let rejected = {
            let mut inner = self.lock();
            let rejected: Vec<_> = inner.queue.drain(..).collect();
            inner.state = ExtensionState::Idle;
            rejected
        };
        tracing::info!(count = rejected.len(), "Rejecting queued requests");
        for pending in rejected {
            let _ = pending
                .responder
                .send(Err(ApiError::SessionEnded("session ended".to_string())));
        }
    }

    /// Replay queued requests one at a time, oldest first
    async fn replay_queue(&self, credential: &Credential) {
        loop {
            let next = {
                let mut inner = self.lock();
                let next = inner.queue.pop_front();
                if next.is_none() {
                    inner.state = ExtensionState::Idle;
                }
                next
            };
            let Some(PendingRequest {
                mut request,
                responder,
            }) = next
            else {
                break;
            };

            let outcome = match attach_bearer(&mut request, credential) {
                Ok(()) => self.replay(request).await,
                Err(e) => Err(e),
            };
            let _ = responder.send(outcome);
        }
    }

    async fn replay(&self, request: Request) -> Result<Response> {
        tracing::debug!(method = %request.method(), url = %request.url(), "Replaying queued request");

        let response = self
            .client
            .execute(request)
            .await
            .map_err(|e| ApiError::from_reqwest(&e))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_from_response(response).await)
        }
    }

    fn set_state(&self, state: ExtensionState) {
        self.lock().state = state;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
