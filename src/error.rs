use crate::credentials::StoreError;
use thiserror::Error;

/// Errors returned by [`crate::lifecycle::TokenLifecycleManager`].
///
/// `Clone` because a single refresh outcome is delivered to every waiter.
#[derive(Clone, Debug, Error)]
pub enum TokenError {
    /// No usable token; the account must re-run authorization.
    #[error("authentication required for {account_id} at {provider}: {reason}")]
    AuthenticationRequired {
        account_id: String,
        provider: String,
        reason: String,
    },

    /// Refresh could not complete; the record is kept and the caller may retry later.
    #[error("token refresh failed for {provider}: {message}")]
    RefreshFailed { provider: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TokenError {
    pub fn authentication_required(
        account_id: &str,
        provider: &str,
        reason: impl Into<String>,
    ) -> Self {
        TokenError::AuthenticationRequired {
            account_id: account_id.to_string(),
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }

    pub fn refresh_failed(provider: &str, message: impl Into<String>) -> Self {
        TokenError::RefreshFailed {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    pub fn requires_reauthorization(&self) -> bool {
        matches!(self, TokenError::AuthenticationRequired { .. })
    }
}
