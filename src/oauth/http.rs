//! Refresh and revocation over standard OAuth 2.0 HTTP endpoints.

use super::{OAuthProviderConfig, RefreshError, RefreshedGrant, TokenRefresher, TokenRevoker};
use crate::credentials::TokenRecord;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    /// Space-delimited, per RFC 6749 §5.1
    #[serde(default)]
    scope: Option<String>,
}

/// OAuth error body (RFC 6749 §5.2)
#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Error codes meaning the refresh token itself is no longer usable.
const INVALID_GRANT_CODES: &[&str] = &["invalid_grant", "invalid_refresh_token", "expired_token"];

/// Calls a provider's token and revocation endpoints.
pub struct HttpOAuthClient {
    config: OAuthProviderConfig,
    http_client: reqwest::Client,
}

impl HttpOAuthClient {
    pub fn new(config: OAuthProviderConfig) -> Self {
        Self {
            config,
            http_client: reqwest::Client::new(),
        }
    }

    pub fn provider(&self) -> &str {
        &self.config.provider
    }

    fn client_form(&self) -> HashMap<&'static str, String> {
        let mut form = HashMap::new();
        form.insert("client_id", self.config.client_id.clone());
        form.insert("client_secret", self.config.client_secret.clone());
        form
    }
}

/// Maps a failed token-endpoint response onto the refresh error taxonomy.
///
/// Some providers answer 200 with an `error` body, so the status alone is not enough.
fn classify_failure(status: StatusCode, body: &str) -> RefreshError {
    let parsed: Option<ErrorResponse> = serde_json::from_str(body).ok();
    let message = match &parsed {
        Some(err) => match &err.error_description {
            Some(description) => format!("{} ({}): {}", err.error, status, description),
            None => format!("{} ({})", err.error, status),
        },
        None => format!("status {}: {}", status, truncate(body, 200)),
    };

    if let Some(err) = &parsed {
        if INVALID_GRANT_CODES.contains(&err.error.as_str()) {
            return RefreshError::InvalidGrant(message);
        }
        if err.error == "temporarily_unavailable" {
            return RefreshError::Transient(message);
        }
    }

    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RefreshError::Transient(message)
    } else {
        RefreshError::Rejected(message)
    }
}

fn truncate(body: &str, max: usize) -> &str {
    match body.char_indices().nth(max) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[async_trait]
impl TokenRefresher for HttpOAuthClient {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedGrant, RefreshError> {
        let mut form = self.client_form();
        form.insert("grant_type", "refresh_token".to_string());
        form.insert("refresh_token", refresh_token.to_string());

        debug!(provider = %self.config.provider, "Calling token endpoint");

        let response = self
            .http_client
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| RefreshError::Transient(format!("token request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RefreshError::Transient(format!("failed to read token response: {}", e)))?;

        if !status.is_success() {
            return Err(classify_failure(status, &body));
        }

        let token_response: TokenResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                // A 200 carrying an OAuth error body
                if serde_json::from_str::<ErrorResponse>(&body).is_ok() {
                    return Err(classify_failure(status, &body));
                }
                return Err(RefreshError::Rejected(format!(
                    "unparseable token response: {}",
                    e
                )));
            }
        };

        debug!(
            provider = %self.config.provider,
            rotated = token_response.refresh_token.is_some(),
            expires_in = ?token_response.expires_in,
            "Token endpoint returned new access token"
        );

        Ok(RefreshedGrant {
            access_token: token_response.access_token,
            refresh_token: token_response.refresh_token,
            expires_at: token_response
                .expires_in
                .map(|secs| Utc::now() + Duration::seconds(secs)),
            scopes: token_response.scope.map(|s| {
                s.split_whitespace()
                    .map(str::to_string)
                    .collect::<BTreeSet<_>>()
            }),
        })
    }
}

#[async_trait]
impl TokenRevoker for HttpOAuthClient {
    async fn revoke(&self, record: &TokenRecord) -> Result<(), RefreshError> {
        let revoke_url = match &self.config.revoke_url {
            Some(url) => url,
            None => {
                debug!(provider = %self.config.provider, "No revocation endpoint configured");
                return Ok(());
            }
        };

        // Revoking the refresh token invalidates the whole grant at most providers
        let (token, hint) = match &record.refresh_token {
            Some(refresh_token) => (refresh_token.clone(), "refresh_token"),
            None => (record.access_token.clone(), "access_token"),
        };

        let mut form = self.client_form();
        form.insert("token", token);
        form.insert("token_type_hint", hint.to_string());

        let response = self
            .http_client
            .post(revoke_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| RefreshError::Transient(format!("revocation request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }
}
