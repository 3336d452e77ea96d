use anyhow::{Context, Result};
use connector_manager::connectors::RestConnector;
use connector_manager::{ConnectorManager, ConnectorRegistry};
use std::sync::Arc;
use tokenhub::config::HubConfig;
use tokenhub::credentials::SqliteTokenStore;
use tokenhub::lifecycle::TokenLifecycleManager;
use tokenhub::oauth::{HttpOAuthClient, OAuthProviderConfig};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "connector_manager=info,tokenhub=info".into()),
        )
        .init();

    info!("Connector Manager starting...");

    let config_path = std::env::var("TOKENHUB_CONFIG").ok();
    let config = HubConfig::load(config_path.as_deref()).context("Failed to load configuration")?;

    let encryption_key = std::env::var("TOKENHUB_ENCRYPTION_KEY")
        .context("TOKENHUB_ENCRYPTION_KEY is required (base64-encoded 32-byte key)")?;

    info!(
        config_path = ?config_path,
        db_path = %config.storage.db_path,
        providers = config.providers.len(),
        rest_connectors = config.rest_connectors.len(),
        "Configuration loaded"
    );

    let store = Arc::new(
        SqliteTokenStore::new(&config.storage.db_path, &encryption_key)
            .context("Failed to initialize token store")?,
    );
    info!("Token store initialized");

    let mut tokens = TokenLifecycleManager::new(store, config.tokens.clone());
    for (provider, endpoints) in &config.providers {
        let Some(oauth) = OAuthProviderConfig::from_env(provider, endpoints) else {
            warn!(
                provider = %provider,
                "OAuth client credentials not set, tokens for this provider cannot be refreshed"
            );
            continue;
        };
        let client = Arc::new(HttpOAuthClient::new(oauth));
        tokens = tokens
            .with_refresher(provider.as_str(), client.clone())
            .with_revoker(provider.as_str(), client);
    }

    let mut registry = ConnectorRegistry::new();
    for rest in config.rest_connectors.iter().cloned() {
        RestConnector::register(&mut registry, rest)?;
    }
    if registry.is_empty() {
        warn!("No connectors configured");
    }

    let mut manager = ConnectorManager::new(
        Arc::new(tokens),
        Arc::new(registry),
        config.dispatch.clone(),
        config.sweep.clone(),
    );
    let report = manager.start().await?;
    info!(
        examined = report.examined,
        refreshed = report.refreshed,
        failed = report.failed,
        "Connector manager started"
    );

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl_c signal")?;
    info!("Shutdown signal received");

    manager.shutdown().await;
    info!("Connector manager stopped");

    Ok(())
}
