//! The body of one refresh flight: read, refresh with retry, version-checked write.

use crate::config::TokenConfig;
use crate::credentials::{StoreError, TokenKey, TokenRecord, TokenStore};
use crate::error::TokenError;
use crate::oauth::{RefreshError, RefreshedGrant, TokenRefresher};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything a spawned flight needs; cloned out of the manager.
#[derive(Clone)]
pub(crate) struct RefreshContext {
    pub store: Arc<dyn TokenStore>,
    pub refresher: Option<Arc<dyn TokenRefresher>>,
    pub config: TokenConfig,
}

impl RefreshContext {
    /// Brings the record for `key` to at least `margin` of remaining validity.
    ///
    /// Re-reads the record first, so a caller that queued behind a just-finished
    /// flight does not refresh again. A lost version race discards the refresh
    /// result and starts over from the read, at most `max_cas_attempts` times.
    pub async fn run(
        self,
        key: TokenKey,
        margin: chrono::Duration,
    ) -> Result<TokenRecord, TokenError> {
        let flight_id = Uuid::new_v4();
        let TokenKey {
            account_id,
            provider,
        } = &key;
        let attempts = self.config.max_cas_attempts.max(1);

        for attempt in 1..=attempts {
            let current = self.store.get(account_id, provider)?.ok_or_else(|| {
                TokenError::authentication_required(account_id, provider, "no token stored")
            })?;

            let now = Utc::now();
            if !current.expires_within(now, margin) {
                debug!(%flight_id, %account_id, %provider, "Token already fresh");
                return Ok(current);
            }

            let refresh_token = match &current.refresh_token {
                Some(refresh_token) => refresh_token.clone(),
                None if current.is_expired(now) => {
                    return Err(TokenError::authentication_required(
                        account_id,
                        provider,
                        "access token expired and no refresh token is held",
                    ));
                }
                // Still usable; nothing to refresh with
                None => return Ok(current),
            };

            let refresher = match &self.refresher {
                Some(refresher) => refresher,
                None if current.is_expired(now) => {
                    return Err(TokenError::refresh_failed(
                        provider,
                        "no refresher configured for provider",
                    ));
                }
                None => {
                    warn!(%account_id, %provider, "Token near expiry but no refresher configured");
                    return Ok(current);
                }
            };

            info!(
                %flight_id,
                %account_id,
                %provider,
                attempt,
                expires_at = ?current.expires_at,
                "Refreshing OAuth token"
            );

            let grant = match self.refresh_with_retry(refresher.as_ref(), &refresh_token, &key).await
            {
                Ok(grant) => grant,
                Err(RefreshError::InvalidGrant(message)) => {
                    self.discard_invalid(&current, &message);
                    return Err(TokenError::authentication_required(
                        account_id,
                        provider,
                        message,
                    ));
                }
                Err(e) => {
                    warn!(%flight_id, %account_id, %provider, error = %e, "Token refresh failed");
                    return Err(TokenError::refresh_failed(provider, e.to_string()));
                }
            };

            let mut next = grant.apply_to(&current);
            match self.store.put(&next, Some(current.version)) {
                Ok(version) => {
                    next.version = version;
                    info!(
                        %flight_id,
                        %account_id,
                        %provider,
                        version,
                        rotated = grant.refresh_token.is_some(),
                        "OAuth token refreshed"
                    );
                    return Ok(next);
                }
                Err(StoreError::VersionConflict { .. }) => {
                    warn!(
                        %flight_id,
                        %account_id,
                        %provider,
                        attempt,
                        "Token record changed during refresh, discarding result"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(TokenError::refresh_failed(
            provider,
            format!("token record kept changing across {} refresh attempts", attempts),
        ))
    }

    /// Calls the refresher with a timeout, retrying transient failures with
    /// exponential backoff.
    async fn refresh_with_retry(
        &self,
        refresher: &dyn TokenRefresher,
        refresh_token: &str,
        key: &TokenKey,
    ) -> Result<RefreshedGrant, RefreshError> {
        let mut retry = 0;
        loop {
            let outcome =
                match tokio::time::timeout(self.config.refresh_timeout(), refresher.refresh(refresh_token))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(RefreshError::Transient(format!(
                        "token endpoint did not answer within {}s",
                        self.config.refresh_timeout_seconds
                    ))),
                };

            match outcome {
                Err(e) if e.is_transient() && retry < self.config.refresh_retries => {
                    retry += 1;
                    let delay = self.config.backoff(retry);
                    warn!(
                        account_id = %key.account_id,
                        provider = %key.provider,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient refresh failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                outcome => return outcome,
            }
        }
    }

    /// Deletes a record whose refresh token the provider refused, unless a
    /// concurrent authorization already replaced it.
    fn discard_invalid(&self, used: &TokenRecord, reason: &str) {
        match self
            .store
            .delete_if(&used.account_id, &used.provider, used.version)
        {
            Ok(true) => warn!(
                account_id = %used.account_id,
                provider = %used.provider,
                reason,
                "Refresh token invalid, token record deleted"
            ),
            Ok(false) => debug!(
                account_id = %used.account_id,
                provider = %used.provider,
                "Record replaced after refresh was rejected, keeping it"
            ),
            Err(e) => warn!(
                account_id = %used.account_id,
                provider = %used.provider,
                error = %e,
                "Failed to delete token record after invalid grant"
            ),
        }
    }
}
