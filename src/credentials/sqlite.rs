//! Encrypted token storage using SQLite.
//!
//! Access and refresh tokens are sealed with AES-256-GCM before they reach disk.
//! Writes are version-checked so concurrent refreshes cannot overwrite each other.

use super::{StoreError, TokenCipher, TokenKey, TokenRecord, TokenStore};
use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Encrypted token storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE oauth_tokens (
///     id INTEGER PRIMARY KEY,
///     account_id TEXT NOT NULL,
///     provider TEXT NOT NULL,
///     access_token TEXT NOT NULL,        -- Encrypted
///     access_token_nonce TEXT NOT NULL,
///     refresh_token TEXT,                -- Encrypted (optional)
///     refresh_token_nonce TEXT,
///     expires_at TEXT,                   -- RFC 3339 (optional)
///     granted_scopes TEXT NOT NULL,      -- JSON array
///     created_at TEXT NOT NULL,
///     updated_at TEXT NOT NULL,
///     version INTEGER NOT NULL,
///     UNIQUE(account_id, provider)
/// );
///
/// -- Last version handed out; survives deletes so versions never repeat
/// CREATE TABLE token_version_seq (
///     id INTEGER PRIMARY KEY CHECK (id = 1),
///     value INTEGER NOT NULL
/// );
/// ```
///
/// # Thread Safety
/// The connection sits behind a `Mutex`; each `put` bumps the sequence and runs
/// one conditional write inside a transaction, so the version check and the
/// write are atomic.
pub struct SqliteTokenStore {
    conn: Mutex<Connection>,
    cipher: TokenCipher,
}

impl SqliteTokenStore {
    /// Creates or opens a token store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file (`":memory:"` for tests)
    /// * `encryption_key` - Base64-encoded 32-byte master key
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> anyhow::Result<Self> {
        let cipher =
            TokenCipher::from_base64_key(encryption_key).context("Invalid encryption key")?;

        let conn = Connection::open(db_path).context("Failed to open token database")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_tokens (
                id INTEGER PRIMARY KEY,
                account_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                access_token TEXT NOT NULL,
                access_token_nonce TEXT NOT NULL,
                refresh_token TEXT,
                refresh_token_nonce TEXT,
                expires_at TEXT,
                granted_scopes TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                version INTEGER NOT NULL,
                UNIQUE(account_id, provider)
            );
            CREATE INDEX IF NOT EXISTS idx_tokens_account ON oauth_tokens(account_id);

            CREATE TABLE IF NOT EXISTS token_version_seq (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                value INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO token_version_seq (id, value)
                SELECT 1, COALESCE(MAX(version), 0) FROM oauth_tokens;
            "#,
        )
        .context("Failed to create oauth_tokens table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Backend("token database mutex poisoned".to_string()))
    }

    fn seal(&self, value: &str) -> Result<(String, String), StoreError> {
        self.cipher
            .seal(value)
            .map_err(|e| StoreError::Crypto(format!("{:#}", e)))
    }

    fn seal_optional(
        &self,
        value: Option<&str>,
    ) -> Result<(Option<String>, Option<String>), StoreError> {
        match value {
            Some(v) => {
                let (sealed, nonce) = self.seal(v)?;
                Ok((Some(sealed), Some(nonce)))
            }
            None => Ok((None, None)),
        }
    }

    fn decode_row(&self, key: &TokenKey, row: StoredRow) -> Result<TokenRecord, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            key: key.clone(),
            reason,
        };

        let access_token = self
            .cipher
            .open(&row.access_token, &row.access_token_nonce)
            .map_err(|e| StoreError::Crypto(format!("access token: {:#}", e)))?;

        let refresh_token = match (row.refresh_token, row.refresh_token_nonce) {
            (Some(sealed), Some(nonce)) => Some(
                self.cipher
                    .open(&sealed, &nonce)
                    .map_err(|e| StoreError::Crypto(format!("refresh token: {:#}", e)))?,
            ),
            _ => None,
        };

        let expires_at = row
            .expires_at
            .map(|s| parse_timestamp(&s))
            .transpose()
            .map_err(|e| corrupt(format!("expires_at: {}", e)))?;

        let granted_scopes: BTreeSet<String> = serde_json::from_str(&row.granted_scopes)
            .map_err(|e| corrupt(format!("granted_scopes: {}", e)))?;

        Ok(TokenRecord {
            account_id: key.account_id.clone(),
            provider: key.provider.clone(),
            access_token,
            refresh_token,
            expires_at,
            granted_scopes,
            created_at: parse_timestamp(&row.created_at)
                .map_err(|e| corrupt(format!("created_at: {}", e)))?,
            updated_at: parse_timestamp(&row.updated_at)
                .map_err(|e| corrupt(format!("updated_at: {}", e)))?,
            version: row.version,
        })
    }
}

/// Raw column values before decryption.
struct StoredRow {
    access_token: String,
    access_token_nonce: String,
    refresh_token: Option<String>,
    refresh_token_nonce: Option<String>,
    expires_at: Option<String>,
    granted_scopes: String,
    created_at: String,
    updated_at: String,
    version: u64,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            access_token: row.get(0)?,
            access_token_nonce: row.get(1)?,
            refresh_token: row.get(2)?,
            refresh_token_nonce: row.get(3)?,
            expires_at: row.get(4)?,
            granted_scopes: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            version: row.get::<_, i64>(8)? as u64,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

impl TokenStore for SqliteTokenStore {
    fn get(&self, account_id: &str, provider: &str) -> Result<Option<TokenRecord>, StoreError> {
        let stored = {
            let conn = self.conn()?;
            conn.query_row(
                r#"
                SELECT access_token, access_token_nonce,
                       refresh_token, refresh_token_nonce,
                       expires_at, granted_scopes,
                       created_at, updated_at, version
                FROM oauth_tokens
                WHERE account_id = ?1 AND provider = ?2
                "#,
                params![account_id, provider],
                StoredRow::from_row,
            )
            .optional()?
        };

        stored
            .map(|row| self.decode_row(&TokenKey::new(account_id, provider), row))
            .transpose()
    }

    fn put(&self, record: &TokenRecord, expected_version: Option<u64>) -> Result<u64, StoreError> {
        let (access_token, access_token_nonce) = self.seal(&record.access_token)?;
        let (refresh_token, refresh_token_nonce) =
            self.seal_optional(record.refresh_token.as_deref())?;
        let expires_at = record.expires_at.map(|dt| dt.to_rfc3339());
        let granted_scopes = serde_json::to_string(&record.granted_scopes)
            .map_err(|e| StoreError::Backend(format!("failed to encode scopes: {}", e)))?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let version: i64 = tx.query_row(
            "UPDATE token_version_seq SET value = value + 1 WHERE id = 1 RETURNING value",
            [],
            |row| row.get(0),
        )?;

        let rows = match expected_version {
            None => tx.execute(
                r#"
                INSERT INTO oauth_tokens (
                    account_id, provider,
                    access_token, access_token_nonce,
                    refresh_token, refresh_token_nonce,
                    expires_at, granted_scopes,
                    created_at, updated_at, version
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ON CONFLICT(account_id, provider) DO NOTHING
                "#,
                params![
                    record.account_id,
                    record.provider,
                    access_token,
                    access_token_nonce,
                    refresh_token,
                    refresh_token_nonce,
                    expires_at,
                    granted_scopes,
                    record.created_at.to_rfc3339(),
                    now,
                    version,
                ],
            )?,
            Some(expected) => tx.execute(
                r#"
                UPDATE oauth_tokens SET
                    access_token = ?3,
                    access_token_nonce = ?4,
                    refresh_token = ?5,
                    refresh_token_nonce = ?6,
                    expires_at = ?7,
                    granted_scopes = ?8,
                    updated_at = ?9,
                    version = ?10
                WHERE account_id = ?1 AND provider = ?2 AND version = ?11
                "#,
                params![
                    record.account_id,
                    record.provider,
                    access_token,
                    access_token_nonce,
                    refresh_token,
                    refresh_token_nonce,
                    expires_at,
                    granted_scopes,
                    now,
                    version,
                    expected as i64,
                ],
            )?,
        };

        if rows == 0 {
            // Dropping the transaction rolls back the sequence bump
            return Err(StoreError::VersionConflict {
                key: record.key(),
                expected: expected_version,
            });
        }

        tx.commit()?;
        Ok(version as u64)
    }

    fn delete(&self, account_id: &str, provider: &str) -> Result<bool, StoreError> {
        let rows = self.conn()?.execute(
            "DELETE FROM oauth_tokens WHERE account_id = ?1 AND provider = ?2",
            params![account_id, provider],
        )?;
        Ok(rows > 0)
    }

    fn delete_if(
        &self,
        account_id: &str,
        provider: &str,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let rows = self.conn()?.execute(
            "DELETE FROM oauth_tokens WHERE account_id = ?1 AND provider = ?2 AND version = ?3",
            params![account_id, provider, expected_version as i64],
        )?;
        Ok(rows > 0)
    }

    fn list_keys(&self) -> Result<Vec<TokenKey>, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT account_id, provider FROM oauth_tokens ORDER BY account_id, provider")?;
        let keys = stmt
            .query_map([], |row| Ok(TokenKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn list_by_account(&self, account_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT provider FROM oauth_tokens WHERE account_id = ?1 ORDER BY provider")?;
        let providers = stmt
            .query_map(params![account_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(providers)
    }
}
