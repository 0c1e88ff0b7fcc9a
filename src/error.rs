// Error handling module
// Defines the error taxonomy shared by the pipeline, refresh and heartbeat paths

use reqwest::StatusCode;
use thiserror::Error;

use crate::auth::CredentialScope;

/// Errors surfaced by the resilience layer.
///
/// `Clone` so that every caller joining a single-flight operation receives
/// the identical error value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    /// No response was received
    #[error("Network error ({kind}): {message}")]
    Network { kind: String, message: String },

    /// 5xx from the backend
    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    /// 401/403, or refresh material rejected by the backend
    #[error("Authentication failed: {status} - {message}")]
    Auth { status: u16, message: String },

    /// 409
    #[error("Conflict: {0}")]
    Conflict(String),

    /// 404/410
    #[error("Resource gone: {status} - {message}")]
    Gone { status: u16, message: String },

    /// Any other 4xx
    #[error("Validation error: {status} - {message}")]
    Validation { status: u16, message: String },

    /// No refresh material stored for the scope
    #[error("No refresh token available for {0} scope")]
    MissingRefreshToken(CredentialScope),

    /// Terminal rejection of a queued request after logout
    #[error("Session ended: {0}")]
    SessionEnded(String),

    #[error("Session start already in progress")]
    StartInProgress,

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Classify a non-success HTTP response
    pub fn from_status(status: StatusCode, message: String) -> Self {
        let code = status.as_u16();
        match code {
            401 | 403 => ApiError::Auth {
                status: code,
                message,
            },
            410 => ApiError::Gone {
                status: code,
                message,
            },
            409 => ApiError::Conflict(message),
            500..=599 => ApiError::Server {
                status: code,
                message,
            },
            _ => ApiError::Validation {
                status: code,
                message,
            },
        }
    }

    /// A 404 on a session resource means the session no longer exists
    pub fn for_session_resource(self) -> Self {
        match self {
            ApiError::Validation {
                status: 404,
                message,
            } => ApiError::Gone {
                status: 404,
                message,
            },
            other => other,
        }
    }

    /// Classify a transport failure (no response received)
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status, err.to_string());
        }

        let kind = if err.is_timeout() {
            "timeout"
        } else if err.is_connect() {
            "connection_failed"
        } else if err.is_request() {
            "request_error"
        } else if err.is_body() {
            "body_error"
        } else if err.is_decode() {
            "decode_error"
        } else {
            "unknown"
        };

        ApiError::Network {
            kind: kind.to_string(),
            message: err.to_string(),
        }
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Server { status, .. }
            | ApiError::Auth { status, .. }
            | ApiError::Gone { status, .. }
            | ApiError::Validation { status, .. } => Some(*status),
            ApiError::Conflict(_) => Some(409),
            _ => None,
        }
    }

    /// True when the stored refresh material can no longer produce credentials
    pub fn is_credential_rejected(&self) -> bool {
        matches!(
            self,
            ApiError::Auth { .. } | ApiError::MissingRefreshToken(_) | ApiError::Validation { .. }
        )
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", err))
    }
}

impl From<rusqlite::Error> for ApiError {
    fn from(err: rusqlite::Error) -> Self {
        ApiError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;
