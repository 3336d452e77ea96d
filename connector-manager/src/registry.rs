//! Connector registry - maps provider ids to connector constructors.
//!
//! Populated once at startup, then shared behind an `Arc` and only read.
//! Lookups need no locking.

use crate::error::DispatchError;
use crate::types::{Capability, CapabilitySet};
use crate::Connector;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Builds a connector bound to an account id.
pub type ConnectorConstructor = Arc<dyn Fn(&str) -> Arc<dyn Connector> + Send + Sync>;

/// Static description of one registered provider.
#[derive(Clone)]
pub struct ConnectorDescriptor {
    pub provider: String,
    pub capabilities: CapabilitySet,
    constructor: ConnectorConstructor,
}

impl ConnectorDescriptor {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn construct(&self, account_id: &str) -> Arc<dyn Connector> {
        (self.constructor)(account_id)
    }
}

impl std::fmt::Debug for ConnectorDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorDescriptor")
            .field("provider", &self.provider)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct ConnectorRegistry {
    descriptors: HashMap<String, ConnectorDescriptor>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider. Re-registering an id replaces the previous entry.
    pub fn register<F>(
        &mut self,
        provider: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
        constructor: F,
    ) where
        F: Fn(&str) -> Arc<dyn Connector> + Send + Sync + 'static,
    {
        let provider = provider.into();
        let descriptor = ConnectorDescriptor {
            provider: provider.clone(),
            capabilities: capabilities.into_iter().collect(),
            constructor: Arc::new(constructor),
        };

        info!(
            provider = %provider,
            capabilities = ?descriptor.capabilities,
            "Registered connector"
        );
        if self.descriptors.insert(provider.clone(), descriptor).is_some() {
            warn!(provider = %provider, "Connector re-registered, previous entry replaced");
        }
    }

    /// Builds a connector for `account_id`.
    pub fn create(&self, provider: &str, account_id: &str) -> Result<Arc<dyn Connector>, DispatchError> {
        self.descriptor(provider)
            .map(|descriptor| descriptor.construct(account_id))
            .ok_or_else(|| DispatchError::UnknownProvider(provider.to_string()))
    }

    pub fn descriptor(&self, provider: &str) -> Option<&ConnectorDescriptor> {
        self.descriptors.get(provider)
    }

    /// Registered provider ids, sorted.
    pub fn providers(&self) -> Vec<&str> {
        let mut providers: Vec<&str> = self.descriptors.keys().map(String::as_str).collect();
        providers.sort_unstable();
        providers
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Stub {
        provider: &'static str,
        account_id: String,
    }

    impl Connector for Stub {
        fn provider(&self) -> &str {
            self.provider
        }

        fn account_id(&self) -> &str {
            &self.account_id
        }
    }

    fn stub(provider: &'static str) -> impl Fn(&str) -> Arc<dyn Connector> + Send + Sync {
        move |account_id: &str| -> Arc<dyn Connector> {
            Arc::new(Stub {
                provider,
                account_id: account_id.to_string(),
            })
        }
    }

    #[test]
    fn test_create_binds_account() {
        let mut registry = ConnectorRegistry::new();
        registry.register("jira", [Capability::Project], stub("jira"));

        let connector = registry.create("jira", "alice@example.com").unwrap();
        assert_eq!(connector.provider(), "jira");
        assert_eq!(connector.account_id(), "alice@example.com");
    }

    #[test]
    fn test_unknown_provider() {
        let registry = ConnectorRegistry::new();
        assert!(matches!(
            registry.create("nope", "a"),
            Err(DispatchError::UnknownProvider(ref p)) if p == "nope"
        ));
    }

    #[test]
    fn test_reregistration_overwrites() {
        let mut registry = ConnectorRegistry::new();
        registry.register("slack", [Capability::Communication], stub("slack"));
        registry.register(
            "slack",
            [Capability::Communication, Capability::Data],
            stub("slack-double"),
        );

        assert_eq!(registry.len(), 1);
        let descriptor = registry.descriptor("slack").unwrap();
        assert!(descriptor.supports(Capability::Data));
        assert_eq!(registry.create("slack", "a").unwrap().provider(), "slack-double");
    }

    #[test]
    fn test_providers_sorted() {
        let mut registry = ConnectorRegistry::new();
        for provider in ["slack", "gmail", "jira"] {
            registry.register(provider, [Capability::Data], stub("x"));
        }
        assert_eq!(registry.providers(), vec!["gmail", "jira", "slack"]);
    }
}
