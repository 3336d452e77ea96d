//! Token lifecycle: hand out valid access tokens, refresh exactly once in flight
//! per (account, provider), revoke on disconnect.
//!
//! # Refresh flow
//!
//! ```text
//! get_valid_token(account, provider)
//!   ├─ no record ─────────────────────────→ AuthenticationRequired
//!   ├─ expires beyond safety margin ──────→ access token (no network)
//!   └─ due: join the single flight for the key
//!         ├─ refresher ok → CAS put(version) → new access token
//!         │     └─ version conflict → re-read, re-evaluate (bounded)
//!         ├─ invalid grant → delete record → AuthenticationRequired (all waiters)
//!         └─ transient → retry with backoff → RefreshFailed (record kept)
//! ```

use crate::config::TokenConfig;
use crate::credentials::{AccessToken, StoreError, TokenKey, TokenRecord, TokenStore};
use crate::error::TokenError;
use crate::oauth::{TokenRefresher, TokenRevoker};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

mod refresh;
mod single_flight;

pub use single_flight::{FlightAborted, SingleFlight};

use refresh::RefreshContext;

/// Outcome of [`TokenLifecycleManager::revoke`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevokeOutcome {
    /// False when there was no record to remove (repeat revocation)
    pub removed: bool,
    /// Set when the provider could not be told; local cleanup still happened
    pub provider_warning: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Active,
    /// Inside the safety margin; the next use will refresh
    Expiring,
    Expired,
    NonExpiring,
}

/// Per-provider connection view for one account.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionStatus {
    pub provider: String,
    pub state: ConnectionState,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub can_refresh: bool,
    /// A refresh for this provider is running right now
    pub refreshing: bool,
    pub updated_at: DateTime<Utc>,
}

/// Result of one proactive sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub refreshed: usize,
    pub failed: usize,
    pub reauthorization_required: usize,
}

/// Keeps access tokens valid for at least the configured safety margin.
///
/// The only component that writes token records; every write is version-checked.
pub struct TokenLifecycleManager {
    store: Arc<dyn TokenStore>,
    config: TokenConfig,
    refreshers: HashMap<String, Arc<dyn TokenRefresher>>,
    revokers: HashMap<String, Arc<dyn TokenRevoker>>,
    flights: SingleFlight<TokenKey, Result<TokenRecord, TokenError>>,
}

impl TokenLifecycleManager {
    pub fn new(store: Arc<dyn TokenStore>, config: TokenConfig) -> Self {
        Self {
            store,
            config,
            refreshers: HashMap::new(),
            revokers: HashMap::new(),
            flights: SingleFlight::new(),
        }
    }

    /// Installs the refresh function for `provider`.
    pub fn with_refresher(
        mut self,
        provider: impl Into<String>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        self.refreshers.insert(provider.into(), refresher);
        self
    }

    /// Installs the revocation call for `provider`.
    pub fn with_revoker(mut self, provider: impl Into<String>, revoker: Arc<dyn TokenRevoker>) -> Self {
        self.revokers.insert(provider.into(), revoker);
        self
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Returns an access token valid for at least the safety margin.
    ///
    /// # Errors
    /// * `AuthenticationRequired` - no record, or the provider rejected the refresh token
    /// * `RefreshFailed` - refresh could not complete; the record is kept
    pub async fn get_valid_token(
        &self,
        account_id: &str,
        provider: &str,
    ) -> Result<AccessToken, TokenError> {
        let margin = self.config.safety_margin();

        let record = self.store.get(account_id, provider)?.ok_or_else(|| {
            TokenError::authentication_required(account_id, provider, "no token stored")
        })?;

        if !record.expires_within(Utc::now(), margin) {
            return Ok(record.access_token());
        }

        let refreshed = self.refresh_shared(record.key(), margin).await?;
        Ok(refreshed.access_token())
    }

    async fn refresh_shared(
        &self,
        key: TokenKey,
        margin: chrono::Duration,
    ) -> Result<TokenRecord, TokenError> {
        let context = RefreshContext {
            store: Arc::clone(&self.store),
            refresher: self.refreshers.get(&key.provider).cloned(),
            config: self.config.clone(),
        };
        let provider = key.provider.clone();

        self.flights
            .run(key.clone(), move || context.run(key, margin))
            .await
            .unwrap_or_else(|FlightAborted| {
                Err(TokenError::refresh_failed(&provider, "refresh task aborted"))
            })
    }

    /// Stores the record produced by an authorization exchange, replacing any
    /// existing grant for the pair. Returns the new version.
    pub fn store_authorized(&self, record: &TokenRecord) -> Result<u64, TokenError> {
        let attempts = self.config.max_cas_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let expected = self
                .store
                .get(&record.account_id, &record.provider)?
                .map(|current| current.version);

            match self.store.put(record, expected) {
                Ok(version) => {
                    info!(
                        account_id = %record.account_id,
                        provider = %record.provider,
                        version,
                        scopes = record.granted_scopes.len(),
                        "Stored authorized token"
                    );
                    return Ok(version);
                }
                Err(StoreError::VersionConflict { .. }) if attempt < attempts => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Best-effort provider revocation followed by unconditional local deletion.
    ///
    /// Idempotent: revoking a pair with no record succeeds with `removed = false`.
    /// A provider failure is returned as a warning in the outcome, not an error.
    pub async fn revoke(&self, account_id: &str, provider: &str) -> Result<RevokeOutcome, TokenError> {
        let record = match self.store.get(account_id, provider)? {
            Some(record) => record,
            None => {
                return Ok(RevokeOutcome {
                    removed: false,
                    provider_warning: None,
                })
            }
        };

        let provider_warning = match self.revokers.get(provider) {
            Some(revoker) => {
                match tokio::time::timeout(self.config.refresh_timeout(), revoker.revoke(&record)).await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some("provider revocation timed out".to_string()),
                }
            }
            None => None,
        };

        if let Some(warning) = &provider_warning {
            warn!(
                %account_id,
                %provider,
                warning = %warning,
                "Provider revocation failed, deleting local token anyway"
            );
        }

        let removed = self.store.delete(account_id, provider)?;
        info!(%account_id, %provider, removed, "Token revoked");

        Ok(RevokeOutcome {
            removed,
            provider_warning,
        })
    }

    /// Connection status for every provider the account holds a token for.
    pub fn connections(&self, account_id: &str) -> Result<Vec<ConnectionStatus>, TokenError> {
        let now = Utc::now();
        let margin = self.config.safety_margin();
        let mut statuses = Vec::new();

        for provider in self.store.list_by_account(account_id)? {
            // Revoked between listing and reading
            let Some(record) = self.store.get(account_id, &provider)? else {
                continue;
            };

            let state = if record.expires_at.is_none() {
                ConnectionState::NonExpiring
            } else if record.is_expired(now) {
                ConnectionState::Expired
            } else if record.expires_within(now, margin) {
                ConnectionState::Expiring
            } else {
                ConnectionState::Active
            };

            statuses.push(ConnectionStatus {
                provider: provider.clone(),
                state,
                expires_at: record.expires_at,
                scopes: record.granted_scopes.iter().cloned().collect(),
                can_refresh: record.refresh_token.is_some(),
                refreshing: self.is_refreshing(account_id, &provider),
                updated_at: record.updated_at,
            });
        }

        Ok(statuses)
    }

    /// Refreshes every refreshable record expiring within `lookahead`.
    ///
    /// Shares the per-key flight with request-path refreshes, so a sweep never
    /// races a caller for the same key.
    pub async fn refresh_expiring(&self, lookahead: chrono::Duration) -> Result<SweepReport, TokenError> {
        let mut report = SweepReport::default();
        let margin = lookahead.max(self.config.safety_margin());

        for key in self.store.list_keys()? {
            let Some(record) = self.store.get(&key.account_id, &key.provider)? else {
                continue;
            };
            report.examined += 1;

            if record.refresh_token.is_none() || !record.expires_within(Utc::now(), margin) {
                continue;
            }

            match self.refresh_shared(key, margin).await {
                Ok(refreshed) if refreshed.version != record.version => report.refreshed += 1,
                Ok(_) => {}
                Err(TokenError::AuthenticationRequired { .. }) => {
                    report.reauthorization_required += 1
                }
                Err(_) => report.failed += 1,
            }
        }

        if report.refreshed + report.failed + report.reauthorization_required > 0 {
            info!(
                examined = report.examined,
                refreshed = report.refreshed,
                failed = report.failed,
                reauthorization_required = report.reauthorization_required,
                "Token sweep complete"
            );
        }

        Ok(report)
    }

    /// True while a refresh for the pair is running.
    pub fn is_refreshing(&self, account_id: &str, provider: &str) -> bool {
        self.flights.is_in_flight(&TokenKey::new(account_id, provider))
    }
}
