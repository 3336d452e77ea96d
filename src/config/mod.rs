use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Complete tokenhub configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    /// OAuth endpoints keyed by provider id. Client credentials come from the
    /// environment, never from this file.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderEndpoints>,
    #[serde(default)]
    pub rest_connectors: Vec<RestConnectorConfig>,
}

/// Token refresh policy
#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    /// Tokens expiring within this window are refreshed before being handed out
    #[serde(default = "default_safety_margin")]
    pub safety_margin_seconds: u64,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_seconds: u64,
    /// Extra attempts after a transient refresh failure
    #[serde(default = "default_refresh_retries")]
    pub refresh_retries: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    /// Bound on read/refresh/write rounds lost to concurrent writers
    #[serde(default = "default_cas_attempts")]
    pub max_cas_attempts: u32,
}

fn default_safety_margin() -> u64 {
    60
}

fn default_refresh_timeout() -> u64 {
    5
}

fn default_refresh_retries() -> u32 {
    2
}

fn default_backoff_base() -> u64 {
    200
}

fn default_cas_attempts() -> u32 {
    3
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            safety_margin_seconds: default_safety_margin(),
            refresh_timeout_seconds: default_refresh_timeout(),
            refresh_retries: default_refresh_retries(),
            backoff_base_ms: default_backoff_base(),
            max_cas_attempts: default_cas_attempts(),
        }
    }
}

impl TokenConfig {
    pub fn safety_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.safety_margin_seconds as i64)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_seconds)
    }

    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

/// Operation dispatch policy
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_data_timeout")]
    pub data_timeout_seconds: u64,
    /// Retries for read-only operations on transient provider errors
    #[serde(default = "default_read_retries")]
    pub read_retries: u32,
    /// Upper bound on a provider-supplied Retry-After hint
    #[serde(default = "default_max_retry_after")]
    pub max_retry_after_seconds: u64,
    #[serde(default = "default_retry_delay")]
    pub default_retry_delay_ms: u64,
}

fn default_data_timeout() -> u64 {
    10
}

fn default_read_retries() -> u32 {
    1
}

fn default_max_retry_after() -> u64 {
    30
}

fn default_retry_delay() -> u64 {
    200
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            data_timeout_seconds: default_data_timeout(),
            read_retries: default_read_retries(),
            max_retry_after_seconds: default_max_retry_after(),
            default_retry_delay_ms: default_retry_delay(),
        }
    }
}

impl DispatchConfig {
    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_seconds)
    }

    /// Wait before a read retry, honoring the provider hint up to the cap.
    pub fn retry_delay(&self, hint: Option<Duration>) -> Duration {
        match hint {
            Some(hint) => hint.min(Duration::from_secs(self.max_retry_after_seconds)),
            None => Duration::from_millis(self.default_retry_delay_ms),
        }
    }
}

/// Proactive refresh sweep
#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_sweep_enabled")]
    pub enabled: bool,
    #[serde(default = "default_sweep_interval")]
    pub interval_seconds: u64,
    /// Records expiring within this window are refreshed by the sweep
    #[serde(default = "default_sweep_lookahead")]
    pub lookahead_seconds: u64,
}

fn default_sweep_enabled() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_sweep_lookahead() -> u64 {
    300
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: default_sweep_enabled(),
            interval_seconds: default_sweep_interval(),
            lookahead_seconds: default_sweep_lookahead(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String {
    "tokenhub.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// OAuth endpoints for one provider
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEndpoints {
    pub token_url: String,
    /// RFC 7009 revocation endpoint; providers without one are only cleaned up locally
    #[serde(default)]
    pub revoke_url: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// A generic JSON REST backend exposed through the Data capability.
#[derive(Debug, Clone, Deserialize)]
pub struct RestConnectorConfig {
    /// Provider id; tokens are looked up under this id
    pub provider: String,
    pub base_url: String,
    /// Collection path relative to `base_url`, e.g. `/v1/documents`
    pub collection_path: String,
    #[serde(default = "default_search_param")]
    pub search_param: String,
    #[serde(default = "default_cursor_param")]
    pub cursor_param: String,
    /// JSON pointer to the item array in list responses (`""` = the body itself)
    #[serde(default)]
    pub items_pointer: String,
    /// JSON pointer to the next-page cursor in list responses
    #[serde(default)]
    pub next_cursor_pointer: Option<String>,
    #[serde(default)]
    pub read_scopes: Vec<String>,
    #[serde(default)]
    pub write_scopes: Vec<String>,
}

fn default_search_param() -> String {
    "q".to_string()
}

fn default_cursor_param() -> String {
    "cursor".to_string()
}

impl HubConfig {
    /// Loads the TOML file when given, then applies `TOKENHUB_*` overrides.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => load_config(path)?,
            None => HubConfig::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Overrides scalar settings from `lookup` (normally the process environment).
    /// Unparseable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            name: &str,
        ) -> Option<T> {
            lookup(name).and_then(|v| v.trim().parse().ok())
        }
        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;

        if let Some(v) = parsed(lookup, "TOKENHUB_SAFETY_MARGIN_SECONDS") {
            self.tokens.safety_margin_seconds = v;
        }
        if let Some(v) = parsed(lookup, "TOKENHUB_REFRESH_TIMEOUT_SECONDS") {
            self.tokens.refresh_timeout_seconds = v;
        }
        if let Some(v) = parsed(lookup, "TOKENHUB_DATA_TIMEOUT_SECONDS") {
            self.dispatch.data_timeout_seconds = v;
        }
        if let Some(v) = parsed(lookup, "TOKENHUB_SWEEP_ENABLED") {
            self.sweep.enabled = v;
        }
        if let Some(v) = parsed(lookup, "TOKENHUB_SWEEP_INTERVAL_SECONDS") {
            self.sweep.interval_seconds = v;
        }
        if let Some(v) = lookup("TOKENHUB_DB_PATH") {
            self.storage.db_path = v;
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> anyhow::Result<HubConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path))?;
    let config: HubConfig =
        toml::from_str(&contents).with_context(|| format!("Invalid config file {}", path))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = HubConfig::default();
        assert_eq!(config.tokens.safety_margin_seconds, 60);
        assert_eq!(config.tokens.refresh_timeout_seconds, 5);
        assert_eq!(config.tokens.refresh_retries, 2);
        assert_eq!(config.tokens.max_cas_attempts, 3);
        assert_eq!(config.dispatch.data_timeout_seconds, 10);
        assert_eq!(config.dispatch.read_retries, 1);
        assert!(config.sweep.enabled);
        assert_eq!(config.sweep.lookahead_seconds, 300);
        assert!(config.providers.is_empty());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [tokens]
            safety_margin_seconds = 120
            backoff_base_ms = 50

            [dispatch]
            max_retry_after_seconds = 5

            [storage]
            db_path = "/var/lib/tokenhub/tokens.db"

            [providers.jira]
            token_url = "https://auth.atlassian.com/oauth/token"
            scopes = ["read:jira-work", "offline_access"]

            [providers.gmail]
            token_url = "https://oauth2.googleapis.com/token"
            revoke_url = "https://oauth2.googleapis.com/revoke"

            [[rest_connectors]]
            provider = "notes"
            base_url = "https://notes.example.com"
            collection_path = "/v1/notes"
            items_pointer = "/data"
            next_cursor_pointer = "/meta/next"
            read_scopes = ["notes.read"]
        "#;

        let config: HubConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.tokens.safety_margin_seconds, 120);
        assert_eq!(config.tokens.refresh_retries, 2); // Default
        assert_eq!(config.dispatch.max_retry_after_seconds, 5);
        assert_eq!(config.storage.db_path, "/var/lib/tokenhub/tokens.db");
        assert_eq!(config.providers.len(), 2);
        assert!(config.providers["jira"].revoke_url.is_none());
        assert_eq!(config.providers["jira"].scopes.len(), 2);

        let rest = &config.rest_connectors[0];
        assert_eq!(rest.search_param, "q");
        assert_eq!(rest.next_cursor_pointer.as_deref(), Some("/meta/next"));
        assert!(rest.write_scopes.is_empty());
    }

    #[test]
    fn test_backoff_doubles() {
        let tokens = TokenConfig::default();
        assert_eq!(tokens.backoff(1), Duration::from_millis(200));
        assert_eq!(tokens.backoff(2), Duration::from_millis(400));
        assert_eq!(tokens.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn test_retry_delay_capped() {
        let dispatch = DispatchConfig::default();
        assert_eq!(dispatch.retry_delay(None), Duration::from_millis(200));
        assert_eq!(
            dispatch.retry_delay(Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            dispatch.retry_delay(Some(Duration::from_secs(3600))),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TOKENHUB_SAFETY_MARGIN_SECONDS", "90"),
            ("TOKENHUB_SWEEP_ENABLED", "false"),
            ("TOKENHUB_DB_PATH", "/tmp/t.db"),
            ("TOKENHUB_DATA_TIMEOUT_SECONDS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = HubConfig::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.tokens.safety_margin_seconds, 90);
        assert!(!config.sweep.enabled);
        assert_eq!(config.storage.db_path, "/tmp/t.db");
        assert_eq!(config.dispatch.data_timeout_seconds, 10); // Ignored
    }

    #[test]
    fn test_load_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenhub.toml");
        std::fs::write(&path, "[sweep]\ninterval_seconds = 15\n").unwrap();

        let config = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(config.sweep.interval_seconds, 15);
        assert!(load_config("/nonexistent/tokenhub.toml").is_err());
    }
}
