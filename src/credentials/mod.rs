//! Versioned OAuth token records and the stores that hold them.
//!
//! Every (account, provider) pair owns at most one [`TokenRecord`]. Writes go
//! through [`TokenStore::put`], which is a compare-and-swap on the record's
//! `version`: a write built from a stale read fails with
//! [`StoreError::VersionConflict`] instead of silently replacing a newer record
//! (for example one carrying a freshly rotated refresh token).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       TokenLifecycleManager              │
//! │  - read / refresh / CAS write / delete   │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       TokenStore (trait)                 │
//! │  - get / put(expected_version) / delete  │
//! └─────────────────────────────────────────┘
//!          ↓                    ↓
//!  SqliteTokenStore       MemoryTokenStore
//!  (AES-256-GCM at rest)  (DashMap)
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use tokenhub::credentials::{SqliteTokenStore, TokenRecord, TokenStore};
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> anyhow::Result<()> {
//! let encryption_key = std::env::var("TOKENHUB_ENCRYPTION_KEY")?;
//! let store = SqliteTokenStore::new("tokens.db", &encryption_key)?;
//!
//! let record = TokenRecord::new("alice@example.com", "slack", "xoxp-access")
//!     .with_refresh_token("xoxe-refresh")
//!     .with_expires_at(Utc::now() + Duration::hours(12));
//!
//! // First write: nothing may exist yet
//! let version = store.put(&record, None)?;
//!
//! // Later writes must name the version they were computed from
//! let current = store.get("alice@example.com", "slack")?.expect("just stored");
//! assert_eq!(current.version, version);
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

mod encryption;
mod memory;
mod sqlite;

pub use encryption::TokenCipher;
pub use memory::MemoryTokenStore;
pub use sqlite::SqliteTokenStore;

/// Identity of a token record: one per (account, provider).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenKey {
    pub account_id: String,
    pub provider: String,
}

impl TokenKey {
    pub fn new(account_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            provider: provider.into(),
        }
    }
}

impl fmt::Display for TokenKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.account_id, self.provider)
    }
}

/// OAuth grant held for one account at one provider.
///
/// # Security
/// - `access_token` and `refresh_token` are encrypted at rest by the SQLite store
/// - `Debug` output redacts both tokens
#[derive(Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub account_id: String,
    pub provider: String,

    /// Credential presented to provider APIs
    pub access_token: String,

    /// Credential used to mint a new access token; absent for non-expiring grants
    pub refresh_token: Option<String>,

    /// Absolute expiry; `None` means the token does not expire
    pub expires_at: Option<DateTime<Utc>>,

    pub granted_scopes: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Optimistic concurrency version, assigned by the store (0 = never stored)
    pub version: u64,
}

impl TokenRecord {
    /// Creates an unsaved record with no refresh token, no expiry and no scopes.
    pub fn new(
        account_id: impl Into<String>,
        provider: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            account_id: account_id.into(),
            provider: provider.into(),
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            granted_scopes: BTreeSet::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.granted_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn key(&self) -> TokenKey {
        TokenKey::new(&self.account_id, &self.provider)
    }

    /// Returns true when the access token expires within `margin` of `now`
    /// (or already has). Non-expiring records never need a refresh.
    pub fn expires_within(&self, now: DateTime<Utc>, margin: chrono::Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - now <= margin,
            None => false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }

    /// Hands out the access token for one provider call.
    pub fn access_token(&self) -> AccessToken {
        AccessToken {
            secret: self.access_token.clone(),
            expires_at: self.expires_at,
            scopes: self.granted_scopes.clone(),
        }
    }
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("account_id", &self.account_id)
            .field("provider", &self.provider)
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &self.refresh_token.as_deref().map(redact))
            .field("expires_at", &self.expires_at)
            .field("granted_scopes", &self.granted_scopes)
            .field("version", &self.version)
            .finish()
    }
}

/// A validated access token handed to a connector for a single call.
///
/// Connectors must not keep it beyond the call: the dispatcher fetches a fresh
/// one every time.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    secret: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: BTreeSet<String>,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            expires_at: None,
            scopes: BTreeSet::new(),
        }
    }

    /// The raw bearer credential. Never log this.
    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Returns the scopes from `required` that this token was not granted.
    pub fn missing_scopes<'a, I>(&self, required: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        required
            .into_iter()
            .filter(|scope| !self.scopes.contains(*scope))
            .map(str::to_string)
            .collect()
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &redact(&self.secret))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Keeps the first four characters of a credential for log correlation.
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(4).collect();
    format!("{}…", prefix)
}

/// Errors raised by a [`TokenStore`].
#[derive(Clone, Debug, Error)]
pub enum StoreError {
    /// The stored version differs from the one the write was computed from
    /// (or the record appeared/disappeared in between).
    #[error("version conflict for {key}: expected {expected:?}")]
    VersionConflict { key: TokenKey, expected: Option<u64> },

    #[error("token storage backend error: {0}")]
    Backend(String),

    #[error("token encryption error: {0}")]
    Crypto(String),

    #[error("corrupt token record for {key}: {reason}")]
    Corrupt { key: TokenKey, reason: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Durable keyed storage of token records. No business logic, no retries.
///
/// Implementations must make `put` atomic with respect to `expected_version`.
pub trait TokenStore: Send + Sync {
    /// Returns the live record for the pair, if any.
    fn get(&self, account_id: &str, provider: &str) -> Result<Option<TokenRecord>, StoreError>;

    /// Writes `record` if the stored version equals `expected_version`.
    ///
    /// `None` means "insert only if no record exists". The record's own
    /// `version` field is ignored; the store assigns and returns the new version.
    /// Versions strictly increase and are never reused for a key, even after
    /// the record is deleted and created again.
    fn put(&self, record: &TokenRecord, expected_version: Option<u64>) -> Result<u64, StoreError>;

    /// Removes the record. Returns false if there was nothing to remove.
    fn delete(&self, account_id: &str, provider: &str) -> Result<bool, StoreError>;

    /// Removes the record only if its version is still `expected_version`.
    /// Returns false when the record is gone or has been replaced.
    fn delete_if(
        &self,
        account_id: &str,
        provider: &str,
        expected_version: u64,
    ) -> Result<bool, StoreError>;

    /// All keys currently stored, ordered by account then provider.
    fn list_keys(&self) -> Result<Vec<TokenKey>, StoreError>;

    /// Providers with a stored record for `account_id`, ordered by name.
    fn list_by_account(&self, account_id: &str) -> Result<Vec<String>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_expires_within_margin() {
        let now = Utc::now();
        let record = TokenRecord::new("a", "p", "tok").with_expires_at(now + Duration::seconds(10));
        assert!(record.expires_within(now, Duration::seconds(60)));
        assert!(!record.expires_within(now, Duration::seconds(5)));
    }

    #[test]
    fn test_non_expiring_never_due() {
        let record = TokenRecord::new("a", "p", "tok");
        assert!(!record.expires_within(Utc::now(), Duration::days(3650)));
        assert!(!record.is_expired(Utc::now()));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let record = TokenRecord::new("a", "p", "secret-access-token")
            .with_refresh_token("secret-refresh-token");
        let debug = format!("{:?}", record);
        assert!(!debug.contains("secret-access-token"));
        assert!(!debug.contains("secret-refresh-token"));
        assert!(debug.contains("secr…"));

        let token = record.access_token();
        assert!(!format!("{:?}", token).contains("secret-access-token"));
        assert_eq!(token.secret(), "secret-access-token");
    }

    #[test]
    fn test_missing_scopes() {
        let token = TokenRecord::new("a", "p", "tok")
            .with_scopes(["read", "write"])
            .access_token();
        assert!(token.missing_scopes(["read"]).is_empty());
        assert_eq!(token.missing_scopes(["read", "admin"]), vec!["admin".to_string()]);
    }
}
