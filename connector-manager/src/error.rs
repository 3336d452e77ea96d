use crate::types::Capability;
use std::time::Duration;
use thiserror::Error;
use tokenhub::TokenError;

/// Failure reported by a connector's provider call, before normalization.
#[derive(Clone, Debug, Error)]
pub enum ProviderError {
    /// Timeout, network error, 5xx or rate limit. Safe to retry for reads.
    #[error("transient provider error: {message}")]
    Transient {
        message: String,
        /// Provider-supplied hint (e.g. `Retry-After`)
        retry_after: Option<Duration>,
    },

    /// The provider refused the request; retrying will not help.
    #[error("provider rejected request ({status:?}): {message}")]
    Permanent { status: Option<u16>, message: String },

    /// The provider no longer accepts the access token.
    #[error("provider rejected credentials: {0}")]
    Unauthorized(String),
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        ProviderError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ProviderError::Permanent {
            status: None,
            message: message.into(),
        }
    }
}

/// Errors returned by [`crate::OperationDispatcher::invoke`].
///
/// Messages never carry token material.
#[derive(Clone, Debug, Error)]
pub enum DispatchError {
    /// The account must (re-)authorize with the provider.
    #[error("authentication required for {account_id} at {provider}: {reason}")]
    AuthenticationRequired {
        account_id: String,
        provider: String,
        reason: String,
    },

    /// Token refresh did not complete; try again later.
    #[error("token refresh failed for {provider}: {message}")]
    RefreshFailed { provider: String, message: String },

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("provider {provider} does not support {capability} operations")]
    CapabilityNotSupported {
        provider: String,
        capability: Capability,
    },

    #[error("transient error from {provider}: {message}")]
    TransientProvider { provider: String, message: String },

    #[error("{provider} rejected the request ({status:?}): {message}")]
    PermanentProvider {
        provider: String,
        status: Option<u16>,
        message: String,
    },

    /// Token storage failed; terminal for this call.
    #[error("token storage error: {0}")]
    Storage(String),
}

impl DispatchError {
    /// True for "try again later" errors.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::RefreshFailed { .. } | DispatchError::TransientProvider { .. }
        )
    }

    /// True when the caller should send the user through authorization again.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(self, DispatchError::AuthenticationRequired { .. })
    }

    pub(crate) fn from_provider(account_id: &str, provider: &str, error: ProviderError) -> Self {
        match error {
            ProviderError::Transient { message, .. } => DispatchError::TransientProvider {
                provider: provider.to_string(),
                message,
            },
            ProviderError::Permanent { status, message } => DispatchError::PermanentProvider {
                provider: provider.to_string(),
                status,
                message,
            },
            ProviderError::Unauthorized(reason) => DispatchError::AuthenticationRequired {
                account_id: account_id.to_string(),
                provider: provider.to_string(),
                reason,
            },
        }
    }
}

impl From<TokenError> for DispatchError {
    fn from(error: TokenError) -> Self {
        match error {
            TokenError::AuthenticationRequired {
                account_id,
                provider,
                reason,
            } => DispatchError::AuthenticationRequired {
                account_id,
                provider,
                reason,
            },
            TokenError::RefreshFailed { provider, message } => {
                DispatchError::RefreshFailed { provider, message }
            }
            TokenError::Store(e) => DispatchError::Storage(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenhub::credentials::StoreError;

    #[test]
    fn test_token_errors_pass_through() {
        let err: DispatchError =
            TokenError::authentication_required("a", "jira", "no token stored").into();
        assert!(err.requires_reauthorization());
        assert!(!err.is_retryable());

        let err: DispatchError = TokenError::refresh_failed("jira", "503").into();
        assert!(err.is_retryable());

        let err: DispatchError = TokenError::Store(StoreError::Backend("disk full".into())).into();
        assert!(matches!(err, DispatchError::Storage(ref m) if m.contains("disk full")));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_provider_errors_normalized() {
        let err = DispatchError::from_provider("a", "jira", ProviderError::transient("timeout"));
        assert!(err.is_retryable());

        let err = DispatchError::from_provider(
            "a",
            "jira",
            ProviderError::Permanent {
                status: Some(404),
                message: "not found".to_string(),
            },
        );
        assert!(matches!(err, DispatchError::PermanentProvider { status: Some(404), .. }));
        assert!(!err.is_retryable());

        let err = DispatchError::from_provider(
            "a",
            "jira",
            ProviderError::Unauthorized("token revoked".to_string()),
        );
        assert!(err.requires_reauthorization());
    }
}
