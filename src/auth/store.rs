// Durable credential storage backed by SQLite
// One slot per scope plus arbitrary cached flags in the same key/value table

use dashmap::DashMap;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use super::types::{Credential, CredentialScope, TokenPair};
use crate::error::{ApiError, Result};

const FLAG_PREFIX: &str = "flag:";

/// Single source of truth for credentials.
///
/// Reads are served from an in-memory cache; every write goes through to the
/// `auth_kv` table so credentials survive a process restart. Only the refresh
/// coordinator and the logout path write credential slots.
pub struct TokenStore {
    conn: Mutex<Connection>,
    cache: DashMap<CredentialScope, TokenPair>,
}

impl TokenStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ApiError::Storage(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        tracing::info!("Opening token store: {}", path.display());
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Store that lives only as long as the process
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )?;

        let cache = DashMap::new();
        for scope in CredentialScope::all() {
            let stored: Option<String> = conn
                .query_row(
                    "SELECT value FROM auth_kv WHERE key = ?",
                    [slot_key(scope)],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(json) = stored {
                match serde_json::from_str::<TokenPair>(&json) {
                    Ok(pair) => {
                        tracing::debug!(scope = %scope, "Loaded persisted credentials");
                        cache.insert(scope, pair);
                    }
                    Err(e) => {
                        tracing::warn!(scope = %scope, error = %e, "Ignoring unreadable credential slot");
                    }
                }
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            cache,
        })
    }

    /// Current access credential for the scope
    pub fn get(&self, scope: CredentialScope) -> Option<Credential> {
        self.cache
            .get(&scope)
            .map(|pair| Credential::from_token(pair.access_token.clone()))
    }

    /// Full token pair for the scope
    pub fn tokens(&self, scope: CredentialScope) -> Option<TokenPair> {
        self.cache.get(&scope).map(|pair| pair.value().clone())
    }

    /// Long-lived refresh material for the scope
    pub fn refresh_token(&self, scope: CredentialScope) -> Option<String> {
        self.cache
            .get(&scope)
            .and_then(|pair| pair.refresh_token.clone())
    }

    /// Replace the scope's credentials and persist them
    pub fn set(&self, scope: CredentialScope, pair: TokenPair) -> Result<()> {
        let json = serde_json::to_string(&pair)?;
        self.write(&slot_key(scope), &json)?;
        self.cache.insert(scope, pair);
        Ok(())
    }

    /// True when there is no credential, it cannot be decoded, or it expires within `window`
    pub fn will_expire_soon(&self, scope: CredentialScope, window: Duration) -> bool {
        match self.get(scope) {
            None => true,
            Some(credential) => credential.will_expire_soon(window),
        }
    }

    /// Drop the scope's credentials from memory and disk
    pub fn clear(&self, scope: CredentialScope) -> Result<()> {
        self.cache.remove(&scope);
        self.delete(&slot_key(scope))
    }

    pub fn set_flag(&self, name: &str, value: &str) -> Result<()> {
        self.write(&format!("{}{}", FLAG_PREFIX, name), value)
    }

    pub fn get_flag(&self, name: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let value = conn
            .query_row(
                "SELECT value FROM auth_kv WHERE key = ?",
                [format!("{}{}", FLAG_PREFIX, name)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn has_flag(&self, name: &str) -> bool {
        matches!(self.get_flag(name), Ok(Some(_)))
    }

    pub fn clear_flag(&self, name: &str) -> Result<()> {
        self.delete(&format!("{}{}", FLAG_PREFIX, name))
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT OR REPLACE INTO auth_kv (key, value) VALUES (?1, ?2)",
            [key, value],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute("DELETE FROM auth_kv WHERE key = ?", [key])?;
        Ok(())
    }
}

fn slot_key(scope: CredentialScope) -> String {
    format!("credentials:{}", scope)
}
