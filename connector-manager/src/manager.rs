//! Connector manager - owns the dispatcher and the proactive refresh sweep.
//!
//! Request-path refreshes happen inside `get_valid_token`; the sweep refreshes
//! tokens that are about to expire so that most requests never wait on a token
//! endpoint.

use crate::dispatcher::OperationDispatcher;
use crate::error::DispatchError;
use crate::registry::ConnectorRegistry;
use crate::types::{Operation, OperationOutput};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokenhub::config::{DispatchConfig, SweepConfig};
use tokenhub::lifecycle::{ConnectionStatus, SweepReport, TokenLifecycleManager};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

/// Connector manager - orchestrates dispatch and background token upkeep.
///
/// # Responsibilities
/// - Route operations through the [`OperationDispatcher`]
/// - Periodically refresh tokens nearing expiry
/// - Report per-account connection status
/// - Graceful shutdown
pub struct ConnectorManager {
    tokens: Arc<TokenLifecycleManager>,
    dispatcher: Arc<OperationDispatcher>,
    sweep: SweepConfig,
    /// Sweep loop task handle
    sweep_handle: Option<JoinHandle<()>>,
    /// Most recent sweep outcome, for monitoring
    last_sweep: Arc<Mutex<Option<SweepReport>>>,
}

impl ConnectorManager {
    pub fn new(
        tokens: Arc<TokenLifecycleManager>,
        registry: Arc<ConnectorRegistry>,
        dispatch: DispatchConfig,
        sweep: SweepConfig,
    ) -> Self {
        let dispatcher = Arc::new(OperationDispatcher::new(
            Arc::clone(&tokens),
            registry,
            dispatch,
        ));
        Self {
            tokens,
            dispatcher,
            sweep,
            sweep_handle: None,
            last_sweep: Arc::new(Mutex::new(None)),
        }
    }

    pub fn dispatcher(&self) -> Arc<OperationDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub async fn invoke(
        &self,
        account_id: &str,
        provider: &str,
        operation: Operation,
    ) -> Result<OperationOutput, DispatchError> {
        self.dispatcher.invoke(account_id, provider, operation).await
    }

    /// Starts the manager.
    ///
    /// Runs one sweep immediately, then spawns the periodic sweep loop when enabled.
    ///
    /// # Returns
    /// The initial sweep report
    pub async fn start(&mut self) -> Result<SweepReport> {
        info!(
            providers = ?self.dispatcher.registry().providers(),
            sweep_enabled = self.sweep.enabled,
            "Starting connector manager"
        );

        if !self.sweep.enabled {
            return Ok(SweepReport::default());
        }

        let lookahead = chrono::Duration::seconds(self.sweep.lookahead_seconds as i64);
        let initial = self
            .tokens
            .refresh_expiring(lookahead)
            .await
            .context("Initial token sweep failed")?;
        *self.last_sweep.lock().await = Some(initial.clone());

        if let Some(old) = self.sweep_handle.take() {
            old.abort();
        }

        let tokens = Arc::clone(&self.tokens);
        let last_sweep = Arc::clone(&self.last_sweep);
        let period = time::Duration::from_secs(self.sweep.interval_seconds.max(1));

        self.sweep_handle = Some(tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            interval.tick().await; // first tick is immediate; initial sweep already ran

            loop {
                interval.tick().await;
                match tokens.refresh_expiring(lookahead).await {
                    Ok(report) => *last_sweep.lock().await = Some(report),
                    Err(e) => warn!(error = %e, "Token sweep failed"),
                }
            }
        }));

        Ok(initial)
    }

    pub async fn last_sweep(&self) -> Option<SweepReport> {
        self.last_sweep.lock().await.clone()
    }

    /// Connection status for every provider the account has authorized.
    pub fn connection_status(&self, account_id: &str) -> Result<Vec<ConnectionStatus>> {
        self.tokens
            .connections(account_id)
            .with_context(|| format!("Failed to read connections for {}", account_id))
    }

    /// Disconnects the account from a provider. Provider-side failures are logged
    /// and do not prevent local cleanup.
    pub async fn disconnect(&self, account_id: &str, provider: &str) -> Result<bool> {
        let outcome = self
            .tokens
            .revoke(account_id, provider)
            .await
            .with_context(|| format!("Failed to revoke {} for {}", provider, account_id))?;
        Ok(outcome.removed)
    }

    /// Stops the sweep loop.
    pub async fn shutdown(&mut self) {
        info!("Shutting down connector manager");
        if let Some(handle) = self.sweep_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        info!("Sweep task stopped");
    }
}

impl Drop for ConnectorManager {
    fn drop(&mut self) {
        if let Some(handle) = self.sweep_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokenhub::config::TokenConfig;
    use tokenhub::credentials::{MemoryTokenStore, TokenRecord, TokenStore};
    use tokenhub::oauth::{refresh_fn, RefreshedGrant};

    fn manager(store: Arc<MemoryTokenStore>, sweep: SweepConfig) -> ConnectorManager {
        let tokens = TokenLifecycleManager::new(store, TokenConfig::default()).with_refresher(
            "jira",
            refresh_fn(|_rt: String| async move {
                Ok(RefreshedGrant::new("swept")
                    .with_expires_at(Utc::now() + chrono::Duration::hours(1)))
            }),
        );
        ConnectorManager::new(
            Arc::new(tokens),
            Arc::new(ConnectorRegistry::new()),
            DispatchConfig::default(),
            sweep,
        )
    }

    #[tokio::test]
    async fn test_start_runs_initial_sweep() {
        let store = Arc::new(MemoryTokenStore::new());
        store
            .put(
                &TokenRecord::new("a", "jira", "old")
                    .with_refresh_token("rt")
                    .with_expires_at(Utc::now() + chrono::Duration::minutes(2)),
                None,
            )
            .unwrap();

        let mut manager = manager(Arc::clone(&store), SweepConfig::default());
        let report = manager.start().await.unwrap();
        assert_eq!(report.refreshed, 1);
        assert_eq!(manager.last_sweep().await, Some(report));
        assert_eq!(store.get("a", "jira").unwrap().unwrap().access_token, "swept");

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_sweep_does_nothing() {
        let store = Arc::new(MemoryTokenStore::new());
        store
            .put(
                &TokenRecord::new("a", "jira", "old")
                    .with_refresh_token("rt")
                    .with_expires_at(Utc::now() + chrono::Duration::minutes(2)),
                None,
            )
            .unwrap();

        let sweep = SweepConfig {
            enabled: false,
            ..SweepConfig::default()
        };
        let mut manager = manager(Arc::clone(&store), sweep);
        assert_eq!(manager.start().await.unwrap(), SweepReport::default());
        assert_eq!(store.get("a", "jira").unwrap().unwrap().access_token, "old");
        assert!(manager.last_sweep().await.is_none());
    }

    #[tokio::test]
    async fn test_status_and_disconnect() {
        let store = Arc::new(MemoryTokenStore::new());
        store
            .put(&TokenRecord::new("a", "notion", "static"), None)
            .unwrap();
        let manager = manager(Arc::clone(&store), SweepConfig::default());

        let status = manager.connection_status("a").unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].provider, "notion");

        assert!(manager.disconnect("a", "notion").await.unwrap());
        assert!(!manager.disconnect("a", "notion").await.unwrap());
        assert!(manager.connection_status("a").unwrap().is_empty());
    }
}
