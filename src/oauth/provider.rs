//! OAuth provider configurations.
//!
//! Endpoints come from the `[providers.<id>]` config sections; client credentials
//! come from `TOKENHUB_OAUTH_<ID>_CLIENT_ID` / `TOKENHUB_OAUTH_<ID>_CLIENT_SECRET`.

use crate::config::ProviderEndpoints;

/// OAuth provider configuration
#[derive(Clone)]
pub struct OAuthProviderConfig {
    pub provider: String,

    /// OAuth token endpoint URL
    pub token_url: String,

    /// RFC 7009 revocation endpoint, if the provider has one
    pub revoke_url: Option<String>,

    pub scopes: Vec<String>,

    /// Client ID (from environment variable)
    pub client_id: String,

    /// Client secret (from environment variable)
    pub client_secret: String,
}

impl OAuthProviderConfig {
    /// Builds the provider config from its endpoints and environment credentials.
    ///
    /// Returns `None` when the client id or secret is not set.
    pub fn from_env(provider: &str, endpoints: &ProviderEndpoints) -> Option<Self> {
        Self::from_lookup(provider, endpoints, |name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(provider: &str, endpoints: &ProviderEndpoints, lookup: F) -> Option<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_prefix = env_prefix(provider);
        let client_id = lookup(&format!("TOKENHUB_OAUTH_{}_CLIENT_ID", env_prefix))?;
        let client_secret = lookup(&format!("TOKENHUB_OAUTH_{}_CLIENT_SECRET", env_prefix))?;

        Some(Self {
            provider: provider.to_string(),
            token_url: endpoints.token_url.clone(),
            revoke_url: endpoints.revoke_url.clone(),
            scopes: endpoints.scopes.clone(),
            client_id,
            client_secret,
        })
    }
}

impl std::fmt::Debug for OAuthProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthProviderConfig")
            .field("provider", &self.provider)
            .field("token_url", &self.token_url)
            .field("revoke_url", &self.revoke_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

/// `google-drive` → `GOOGLE_DRIVE`
fn env_prefix(provider: &str) -> String {
    provider
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn endpoints() -> ProviderEndpoints {
        ProviderEndpoints {
            token_url: "https://example.com/oauth/token".to_string(),
            revoke_url: None,
            scopes: vec!["read".to_string()],
        }
    }

    #[test]
    fn test_env_prefix() {
        assert_eq!(env_prefix("jira"), "JIRA");
        assert_eq!(env_prefix("google-drive"), "GOOGLE_DRIVE");
        assert_eq!(env_prefix("ms.teams"), "MS_TEAMS");
    }

    #[test]
    fn test_credentials_from_lookup() {
        let env: HashMap<String, String> = [
            ("TOKENHUB_OAUTH_GOOGLE_DRIVE_CLIENT_ID", "cid"),
            ("TOKENHUB_OAUTH_GOOGLE_DRIVE_CLIENT_SECRET", "very-secret"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config =
            OAuthProviderConfig::from_lookup("google-drive", &endpoints(), |n| env.get(n).cloned())
                .expect("credentials present");
        assert_eq!(config.client_id, "cid");
        assert_eq!(config.token_url, "https://example.com/oauth/token");
        assert!(!format!("{:?}", config).contains("very-secret"));
    }

    #[test]
    fn test_missing_secret() {
        let config = OAuthProviderConfig::from_lookup("jira", &endpoints(), |n| {
            n.ends_with("CLIENT_ID").then(|| "cid".to_string())
        });
        assert!(config.is_none());
    }
}
