// Authentication types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::claims;

/// Independent authentication identity with its own token lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CredentialScope {
    /// Ordinary learner session
    User,

    /// Privileged service identity
    Admin,
}

impl CredentialScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialScope::User => "user",
            CredentialScope::Admin => "admin",
        }
    }

    pub fn all() -> [CredentialScope; 2] {
        [CredentialScope::User, CredentialScope::Admin]
    }
}

impl fmt::Display for CredentialScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access credential with the expiry taken from its embedded claims.
///
/// `expires_at` is `None` when the token could not be decoded or carries no
/// `exp` claim; such a credential always counts as expiring.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub value: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Build a credential from a raw access token
    pub fn from_token(value: impl Into<String>) -> Self {
        let value = value.into();
        let expires_at = claims::decode_expiry(&value);
        Self { value, expires_at }
    }

    /// `now + window >= expires_at`, fail-closed when the expiry is unknown
    pub fn will_expire_soon(&self, window: Duration) -> bool {
        match self.expires_at {
            None => true,
            Some(exp) => {
                let window = chrono::Duration::milliseconds(window.as_millis() as i64);
                Utc::now() + window >= exp
            }
        }
    }

    /// Check if the credential is actually expired (not just expiring soon)
    pub fn is_expired(&self) -> bool {
        self.will_expire_soon(Duration::ZERO)
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.value)
    }

    /// Short prefix that is safe to log
    pub fn redacted(&self) -> &str {
        let end = self
            .value
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.value.len());
        &self.value[..end]
    }
}

/// Access + refresh material, as persisted and as returned by login/refresh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Login request body
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Refresh request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Response of the validate endpoint
#[derive(Debug, Deserialize)]
pub struct ValidateResponse {
    pub valid: bool,
}

/// Authenticated user profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub username: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}
