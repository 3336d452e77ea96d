//! Provider-side OAuth calls: refreshing and revoking grants.
//!
//! The lifecycle manager only sees the [`TokenRefresher`] and [`TokenRevoker`]
//! traits. [`HttpOAuthClient`] implements both against standard RFC 6749 /
//! RFC 7009 endpoints; tests inject closures through [`refresh_fn`].

use crate::credentials::TokenRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

mod http;
mod provider;

pub use http::HttpOAuthClient;
pub use provider::OAuthProviderConfig;

/// Result of a successful refresh.
#[derive(Clone)]
pub struct RefreshedGrant {
    pub access_token: String,
    /// A rotated refresh token. `None` keeps the current one.
    pub refresh_token: Option<String>,
    /// `None` means the new access token does not expire.
    pub expires_at: Option<DateTime<Utc>>,
    /// Scopes reported by the provider. `None` keeps the current set.
    pub scopes: Option<BTreeSet<String>>,
}

impl RefreshedGrant {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            scopes: None,
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

    /// Applies this grant on top of `current`, keeping the old refresh token
    /// and scopes where the provider returned none.
    pub fn apply_to(&self, current: &TokenRecord) -> TokenRecord {
        let mut next = current.clone();
        next.access_token = self.access_token.clone();
        if let Some(refresh_token) = &self.refresh_token {
            next.refresh_token = Some(refresh_token.clone());
        }
        next.expires_at = self.expires_at;
        if let Some(scopes) = &self.scopes {
            next.granted_scopes = scopes.clone();
        }
        next.updated_at = Utc::now();
        next
    }
}

impl std::fmt::Debug for RefreshedGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshedGrant")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// How a refresh or revocation call failed.
#[derive(Clone, Debug, Error)]
pub enum RefreshError {
    /// The refresh token itself is invalid, expired or revoked.
    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),

    /// Network error, timeout or provider 5xx. Worth retrying.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// The provider refused the request for a reason unrelated to the grant
    /// (bad client credentials, malformed request). Retrying will not help.
    #[error("provider rejected request: {0}")]
    Rejected(String),
}

impl RefreshError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RefreshError::Transient(_))
    }
}

/// Mints a new access token from a refresh token. One per provider.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedGrant, RefreshError>;
}

/// Tells the provider to invalidate a grant.
#[async_trait]
pub trait TokenRevoker: Send + Sync {
    async fn revoke(&self, record: &TokenRecord) -> Result<(), RefreshError>;
}

struct FnRefresher<F>(F);

#[async_trait]
impl<F, Fut> TokenRefresher for FnRefresher<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<RefreshedGrant, RefreshError>> + Send,
{
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshedGrant, RefreshError> {
        (self.0)(refresh_token.to_string()).await
    }
}

/// Wraps an async closure as a [`TokenRefresher`].
///
/// ```
/// use tokenhub::oauth::{refresh_fn, RefreshedGrant};
///
/// let refresher = refresh_fn(|refresh_token: String| async move {
///     Ok(RefreshedGrant::new(format!("access-for-{}", refresh_token)))
/// });
/// # let _ = refresher;
/// ```
pub fn refresh_fn<F, Fut>(f: F) -> Arc<dyn TokenRefresher>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<RefreshedGrant, RefreshError>> + Send + 'static,
{
    Arc::new(FnRefresher(f))
}
