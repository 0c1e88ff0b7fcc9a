// Publish/subscribe channel for session lifecycle notifications

use std::time::Duration;
use tokio::sync::broadcast;

use crate::auth::CredentialScope;

const DEFAULT_CAPACITY: usize = 64;

/// Notification emitted by the resilience layer
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    CredentialRefreshed {
        scope: CredentialScope,
    },

    /// Unrecoverable auth failure: the client must go back to the login entry point
    LoginRequired {
        scope: CredentialScope,
        reason: String,
    },

    /// A confirmation prompt is being shown
    ExtensionRequested {
        queued: usize,
    },

    ExtensionResolved {
        extended: bool,
    },

    HeartbeatStarted {
        session_id: String,
    },

    HeartbeatWarning {
        session_id: String,
        expires_in: Duration,
    },

    HeartbeatExpired {
        session_id: String,
        message: String,
    },

    HeartbeatEnded {
        session_id: String,
    },

    ItemCompleted {
        course_id: String,
        lesson_id: String,
    },

    ItemMarkedIncomplete {
        course_id: String,
        lesson_id: String,
    },

    ModuleInitialized {
        course_id: String,
        module_id: String,
    },
}

/// Queued fan-out of `SessionEvent`s to any number of observers
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register an observer; it sees every event published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Dispatch to all current observers; a bus without observers drops the event
    pub fn publish(&self, event: SessionEvent) {
        tracing::debug!(event = ?event, "Publishing session event");
        let _ = self.sender.send(event);
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
