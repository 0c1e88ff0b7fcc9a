// Heartbeat session tracker
// Keeps a remote study session alive while the learner is active

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::auth::CredentialScope;
use crate::error::{ApiError, Result};
use crate::events::{EventBus, SessionEvent};
use crate::http_client::ApiClient;

const EXPIRED_MESSAGE: &str = "Your study session has expired. Start a new session to continue.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Active,
    Warning,
    Expired,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Starting, Active) | (Active, Warning) | (Warning, Active) | (Expired, Starting) | (_, Expired)
        )
    }

    /// Heartbeats are only sent for a live session
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Warning)
    }
}

/// Snapshot of the tracked remote session
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatSession {
    /// Empty until the backend assigns one
    pub session_id: String,
    pub course_id: String,
    pub module_id: String,
    pub lesson_id: String,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub state: SessionState,
}

impl HeartbeatSession {
    fn advance(&mut self, next: SessionState) -> bool {
        if self.state == next {
            return true;
        }
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                session_id = %self.session_id,
                from = ?self.state,
                to = ?next,
                "Ignoring invalid heartbeat session transition"
            );
            return false;
        }
        tracing::debug!(session_id = %self.session_id, from = ?self.state, to = ?next, "Heartbeat session transition");
        self.state = next;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatSettings {
    /// Time between heartbeats
    pub interval: Duration,

    /// Server-side inactivity timeout of a session
    pub timeout: Duration,

    /// How long before the timeout the warning fires
    pub warning_window: Duration,
}

impl HeartbeatSettings {
    /// Delay from the last successful heartbeat to the warning
    pub fn warning_delay(&self) -> Duration {
        self.timeout.saturating_sub(self.warning_window)
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(1800),
            warning_window: Duration::from_secs(300),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest<'a> {
    course_id: &'a str,
    module_id: &'a str,
    lesson_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartResponse {
    session_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatRequest<'a> {
    session_id: &'a str,
    module_id: &'a str,
    lesson_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveSession {
    session_id: String,
    #[serde(default)]
    module_id: Option<String>,
    #[serde(default)]
    lesson_id: Option<String>,
}

struct TrackerState {
    session: Option<HeartbeatSession>,
    visible: bool,
    /// Bumped whenever the tracked session is replaced or dropped
    generation: u64,
    interval_task: Option<JoinHandle<()>>,
    warning_task: Option<JoinHandle<()>>,
}

impl TrackerState {
    fn stop_interval(&mut self) {
        if let Some(task) = self.interval_task.take() {
            task.abort();
        }
    }

    fn stop_timers(&mut self) {
        self.stop_interval();
        if let Some(task) = self.warning_task.take() {
            task.abort();
        }
    }
}

struct Shared {
    api: Arc<ApiClient>,
    events: EventBus,
    settings: HeartbeatSettings,
    starting: AtomicBool,
    state: Mutex<TrackerState>,
}

/// Resets the start guard however `start` exits
struct StartGuard<'a>(&'a AtomicBool);

impl Drop for StartGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Heartbeat session tracker
///
/// Sends periodic heartbeats while visible, warns before the server-side
/// timeout and expires the session when the backend no longer knows it.
/// Dropping the tracker cancels its timers.
pub struct HeartbeatTracker {
    shared: Arc<Shared>,
}

impl HeartbeatTracker {
    pub fn new(api: Arc<ApiClient>, events: EventBus, settings: HeartbeatSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                api,
                events,
                settings,
                starting: AtomicBool::new(false),
                state: Mutex::new(TrackerState {
                    session: None,
                    visible: true,
                    generation: 0,
                    interval_task: None,
                    warning_task: None,
                }),
            }),
        }
    }

    pub fn settings(&self) -> HeartbeatSettings {
        self.shared.settings
    }

    pub fn state(&self) -> Option<SessionState> {
        self.shared.lock().session.as_ref().map(|s| s.state)
    }

    pub fn session(&self) -> Option<HeartbeatSession> {
        self.shared.lock().session.clone()
    }

    /// Start (or reuse) a session for the course at the given location
    pub async fn start(
        &self,
        course_id: &str,
        module_id: &str,
        lesson_id: &str,
    ) -> Result<HeartbeatSession> {
        if let Some(session) = self.shared.reuse_compatible(course_id, module_id, lesson_id) {
            tracing::debug!(session_id = %session.session_id, course_id = %course_id, "Reusing active heartbeat session");
            return Ok(session);
        }

        if self
            .shared
            .starting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(course_id = %course_id, "Heartbeat session start already in progress");
            return Err(ApiError::StartInProgress);
        }
        let _guard = StartGuard(&self.shared.starting);

        // Another course's session is closed before the new one opens
        let previous = {
            let mut state = self.shared.lock();
            state.stop_timers();
            state.generation += 1;
            let previous = state.session.take();
            state.session = Some(HeartbeatSession {
                session_id: String::new(),
                course_id: course_id.to_string(),
                module_id: module_id.to_string(),
                lesson_id: lesson_id.to_string(),
                last_heartbeat_at: None,
                state: SessionState::Starting,
            });
            previous
        };
        if let Some(previous) = previous.filter(|s| s.state.is_live()) {
            if let Err(e) = self.shared.end_remote(&previous.session_id).await {
                tracing::warn!(session_id = %previous.session_id, error = %e, "Failed to end previous session");
            }
            self.shared.events.publish(SessionEvent::HeartbeatEnded {
                session_id: previous.session_id,
            });
        }
        let generation = self.shared.lock().generation;

        tracing::info!(course_id = %course_id, module_id = %module_id, lesson_id = %lesson_id, "Starting heartbeat session");

        let (session_id, module_id, lesson_id) =
            match self.shared.request_start(course_id, module_id, lesson_id).await {
                Ok(session_id) => (session_id, module_id.to_string(), lesson_id.to_string()),
                Err(ApiError::Conflict(_)) => {
                    tracing::info!(course_id = %course_id, "Session already active, fetching it");
                    match self.shared.fetch_active(course_id).await {
                        Ok(active) => (
                            active.session_id,
                            active.module_id.unwrap_or_else(|| module_id.to_string()),
                            active.lesson_id.unwrap_or_else(|| lesson_id.to_string()),
                        ),
                        Err(e) => {
                            self.shared.abandon_start(generation);
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(course_id = %course_id, error = %e, "Failed to start heartbeat session");
                    self.shared.abandon_start(generation);
                    return Err(e);
                }
            };

        let started = {
            let mut state = self.shared.lock();
            let visible = state.visible;
            let current = state.generation == generation;
            match state.session.as_mut() {
                Some(session) if current => {
                    session.session_id = session_id.clone();
                    session.module_id = module_id;
                    session.lesson_id = lesson_id;
                    session.last_heartbeat_at = Some(Utc::now());
                    session.advance(SessionState::Active);
                    let session = session.clone();

                    if visible {
                        state.interval_task = Some(spawn_interval(&self.shared, false));
                    }
                    state.warning_task = Some(spawn_warning(&self.shared, generation));
                    Some(session)
                }
                _ => None,
            }
        };

        // Closed while the start was in flight; the backend session is orphaned
        let Some(session) = started else {
            tracing::info!(session_id = %session_id, "Session closed while starting, ending it");
            if let Err(e) = self.shared.end_remote(&session_id).await {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to end orphaned session");
            }
            return Err(ApiError::SessionEnded(
                "session closed while starting".to_string(),
            ));
        };

        tracing::info!(session_id = %session.session_id, "Heartbeat session active");
        self.shared.events.publish(SessionEvent::HeartbeatStarted {
            session_id: session.session_id.clone(),
        });
        Ok(session)
    }

    /// Send one heartbeat now
    pub async fn heartbeat(&self) -> Result<()> {
        self.shared.heartbeat().await
    }

    /// Update the location reported by later heartbeats
    pub fn set_location(&self, module_id: &str, lesson_id: &str) {
        let mut state = self.shared.lock();
        if let Some(session) = state.session.as_mut() {
            session.module_id = module_id.to_string();
            session.lesson_id = lesson_id.to_string();
        }
    }

    /// Pause heartbeats while hidden; resume with an immediate heartbeat
    pub fn set_visible(&self, visible: bool) {
        let mut state = self.shared.lock();
        if state.visible == visible {
            return;
        }
        state.visible = visible;

        if !visible {
            tracing::debug!("Page hidden, pausing heartbeats");
            state.stop_interval();
            return;
        }

        let live = state.session.as_ref().map_or(false, |s| s.state.is_live());
        if live && state.interval_task.is_none() {
            tracing::debug!("Page visible, resuming heartbeats");
            state.interval_task = Some(spawn_interval(&self.shared, true));
        }
    }

    /// Best-effort end notice that is not awaited
    pub fn unload(&self) {
        let Some(session) = self.shared.close() else {
            return;
        };
        if session.session_id.is_empty() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = Arc::clone(&self.shared);
                handle.spawn(async move {
                    if let Err(e) = shared.end_remote(&session.session_id).await {
                        tracing::debug!(session_id = %session.session_id, error = %e, "Unload end notice failed");
                    }
                });
            }
            Err(_) => {
                tracing::debug!(session_id = %session.session_id, "No runtime available for unload end notice");
            }
        }
    }

    /// End the session and wait for the backend
    pub async fn end(&self) -> Result<()> {
        let Some(session) = self.shared.close() else {
            return Ok(());
        };
        if session.session_id.is_empty() {
            return Ok(());
        }

        let result = self.shared.end_remote(&session.session_id).await;
        if let Err(ref e) = result {
            tracing::warn!(session_id = %session.session_id, error = %e, "Failed to end heartbeat session");
        }
        self.shared.events.publish(SessionEvent::HeartbeatEnded {
            session_id: session.session_id,
        });
        result
    }
}

impl Drop for HeartbeatTracker {
    fn drop(&mut self) {
        self.shared.lock().stop_timers();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reuse_compatible(
        &self,
        course_id: &str,
        module_id: &str,
        lesson_id: &str,
    ) -> Option<HeartbeatSession> {
        let mut state = self.lock();
        let session = state.session.as_mut()?;
        if session.course_id != course_id || !session.state.is_live() {
            return None;
        }
        session.module_id = module_id.to_string();
        session.lesson_id = lesson_id.to_string();
        Some(session.clone())
    }

    fn abandon_start(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation == generation {
            state.session = None;
        }
    }

    /// Drop the tracked session and its timers
    fn close(&self) -> Option<HeartbeatSession> {
        let mut state = self.lock();
        state.stop_timers();
        state.generation += 1;
        state.session.take()
    }

    async fn heartbeat(self: &Arc<Self>) -> Result<()> {
        let (session_id, module_id, lesson_id, generation) = {
            let state = self.lock();
            match state.session.as_ref() {
                Some(s) if s.state.is_live() => (
                    s.session_id.clone(),
                    s.module_id.clone(),
                    s.lesson_id.clone(),
                    state.generation,
                ),
                _ => {
                    return Err(ApiError::SessionEnded(
                        "no active heartbeat session".to_string(),
                    ))
                }
            }
        };

        let endpoints = self.api.endpoints();
        let body = HeartbeatRequest {
            session_id: &session_id,
            module_id: &module_id,
            lesson_id: &lesson_id,
        };
        let builder = self.api.post(&endpoints.session_heartbeat()).json(&body);

        let outcome = self
            .api
            .send(CredentialScope::User, builder)
            .await
            .map_err(ApiError::for_session_resource);
        match outcome {
            Ok(_) => {
                tracing::debug!(session_id = %session_id, "Heartbeat acknowledged");
                let mut state = self.lock();
                if state.generation != generation {
                    return Ok(());
                }
                if let Some(session) = state.session.as_mut() {
                    session.last_heartbeat_at = Some(Utc::now());
                    session.advance(SessionState::Active);
                }
                if let Some(task) = state.warning_task.take() {
                    task.abort();
                }
                state.warning_task = Some(spawn_warning(self, generation));
                Ok(())
            }
            Err(e @ ApiError::Gone { .. }) => {
                tracing::warn!(session_id = %session_id, error = %e, "Heartbeat session expired");
                let expired = {
                    let mut state = self.lock();
                    if state.generation != generation {
                        false
                    } else {
                        state.stop_timers();
                        state
                            .session
                            .as_mut()
                            .map_or(false, |s| s.advance(SessionState::Expired))
                    }
                };
                if expired {
                    self.events.publish(SessionEvent::HeartbeatExpired {
                        session_id,
                        message: EXPIRED_MESSAGE.to_string(),
                    });
                }
                Err(e)
            }
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Heartbeat failed");
                Err(e)
            }
        }
    }

    fn warn(&self, generation: u64) {
        let session_id = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            match state.session.as_mut() {
                Some(session) if session.state == SessionState::Active => {
                    session.advance(SessionState::Warning);
                    session.session_id.clone()
                }
                _ => return,
            }
        };

        tracing::warn!(session_id = %session_id, "Heartbeat session about to time out");
        self.events.publish(SessionEvent::HeartbeatWarning {
            session_id,
            expires_in: self.settings.warning_window,
        });
    }

    async fn request_start(&self, course_id: &str, module_id: &str, lesson_id: &str) -> Result<String> {
        let body = StartRequest {
            course_id,
            module_id,
            lesson_id,
        };
        let builder = self
            .api
            .post(&self.api.endpoints().session_start())
            .json(&body);
        let response: StartResponse = self.api.send_json(CredentialScope::User, builder).await?;
        Ok(response.session_id)
    }

    async fn fetch_active(&self, course_id: &str) -> Result<ActiveSession> {
        let builder = self
            .api
            .get(&self.api.endpoints().session_active())
            .query(&[("courseId", course_id)]);
        self.api
            .send_json(CredentialScope::User, builder)
            .await
            .map_err(ApiError::for_session_resource)
    }

    async fn end_remote(&self, session_id: &str) -> Result<()> {
        let builder = self.api.put(&self.api.endpoints().session_end(session_id));
        self.api
            .send(CredentialScope::User, builder)
            .await
            .map_err(ApiError::for_session_resource)?;
        tracing::info!(session_id = %session_id, "Heartbeat session ended");
        Ok(())
    }
}

fn spawn_interval(shared: &Arc<Shared>, immediate: bool) -> JoinHandle<()> {
    let weak: Weak<Shared> = Arc::downgrade(shared);
    let period = shared.settings.interval;

    tokio::spawn(async move {
        let first = if immediate {
            Instant::now()
        } else {
            Instant::now() + period
        };
        let mut ticker = tokio::time::interval_at(first, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(shared) = weak.upgrade() else {
                break;
            };
            // Errors are logged inside; only expiry stops the loop
            let _ = shared.heartbeat().await;
            if !shared.lock().session.as_ref().map_or(false, |s| s.state.is_live()) {
                break;
            }
        }
    })
}

fn spawn_warning(shared: &Arc<Shared>, generation: u64) -> JoinHandle<()> {
    let weak: Weak<Shared> = Arc::downgrade(shared);
    let delay = shared.settings.warning_delay();

    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(shared) = weak.upgrade() {
            shared.warn(generation);
        }
    })
}
