use super::{ProbeResult, ProviderAdapter, ProviderId};
use crate::errors::{OrchestrationError, OrchestrationResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Diagnostic view of a registered provider.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProviderDescriptor {
    pub id: ProviderId,
    pub display_name: String,
    pub configured: bool,
    pub required_credentials: Vec<String>,
    pub model_max_tokens: u32,
}

/// Registry of provider adapters keyed by identity. Built once at startup and
/// read-only afterwards.
#[derive(Default, Clone)]
pub struct ProviderCatalog {
    adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
    order: Vec<ProviderId>,
}

impl ProviderCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) -> OrchestrationResult<()> {
        let id = adapter.id();
        if self.adapters.contains_key(&id) {
            return Err(OrchestrationError::Configuration(format!(
                "provider '{id}' registered twice"
            )));
        }
        debug!(provider = %id, "Registered provider adapter");
        self.order.push(id.clone());
        self.adapters.insert(id, adapter);
        Ok(())
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ProviderAdapter>) -> OrchestrationResult<Self> {
        self.register(adapter)?;
        Ok(self)
    }

    pub fn get(&self, id: &ProviderId) -> OrchestrationResult<Arc<dyn ProviderAdapter>> {
        self.adapters
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestrationError::UnsupportedProvider(id.clone()))
    }

    pub fn contains(&self, id: &ProviderId) -> bool {
        self.adapters.contains_key(id)
    }

    /// Identities in registration order.
    pub fn ids(&self) -> &[ProviderId] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Credential check. Unknown ids are a configuration error as well.
    pub fn check_configured(&self, id: &ProviderId) -> OrchestrationResult<()> {
        let adapter = self.get(id)?;
        if adapter.check_configured() {
            Ok(())
        } else {
            Err(OrchestrationError::MissingCredentials {
                provider: id.clone(),
                missing: adapter.required_credential_names(),
            })
        }
    }

    /// Connectivity probe bounded by `timeout`. An adapter error or an elapsed
    /// timeout both count as unreachable.
    pub async fn probe(&self, id: &ProviderId, timeout: Duration) -> OrchestrationResult<ProbeResult> {
        let adapter = self.get(id)?;
        let start = Instant::now();

        let result = match tokio::time::timeout(timeout, adapter.check_reachable()).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(provider = %id, "Reachability check failed: {:#}", e);
                ProbeResult::unreachable(start.elapsed().as_millis() as u64)
            }
            Err(_) => {
                warn!(provider = %id, timeout_ms = timeout.as_millis() as u64, "Reachability check timed out");
                ProbeResult::unreachable(timeout.as_millis() as u64)
            }
        };
        Ok(result)
    }

    pub fn describe(&self) -> Vec<ProviderDescriptor> {
        self.order
            .iter()
            .filter_map(|id| self.adapters.get(id).map(|a| (id, a)))
            .map(|(id, adapter)| ProviderDescriptor {
                id: id.clone(),
                display_name: adapter.display_name(),
                configured: adapter.check_configured(),
                required_credentials: adapter.required_credential_names(),
                model_max_tokens: adapter.model_max_tokens(),
            })
            .collect()
    }
}

impl std::fmt::Debug for ProviderCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCatalog")
            .field("providers", &self.order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockProviderAdapter;

    fn mock(id: &'static str, configured: bool) -> MockProviderAdapter {
        let mut adapter = MockProviderAdapter::new();
        adapter.expect_id().return_const(ProviderId::new(id));
        adapter.expect_check_configured().return_const(configured);
        adapter
            .expect_required_credential_names()
            .returning(|| vec!["API_KEY".to_string()]);
        adapter
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut catalog = ProviderCatalog::new();
        catalog.register(Arc::new(mock("a", true))).expect("first");
        let err = catalog.register(Arc::new(mock("a", true))).unwrap_err();
        assert!(matches!(err, OrchestrationError::Configuration(_)));
    }

    #[test]
    fn test_unknown_and_unconfigured_providers() {
        let catalog = ProviderCatalog::new()
            .with_adapter(Arc::new(mock("keyless", false)))
            .expect("register");

        match catalog.check_configured(&ProviderId::new("keyless")) {
            Err(OrchestrationError::MissingCredentials { missing, .. }) => {
                assert_eq!(missing, vec!["API_KEY".to_string()])
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            catalog.check_configured(&ProviderId::new("ghost")),
            Err(OrchestrationError::UnsupportedProvider(_))
        ));
    }

    #[tokio::test]
    async fn test_probe_error_counts_as_unreachable() {
        let mut adapter = mock("flaky", true);
        adapter
            .expect_check_reachable()
            .returning(|| Err(anyhow::anyhow!("connection refused")));
        let catalog = ProviderCatalog::new()
            .with_adapter(Arc::new(adapter))
            .expect("register");

        let result = catalog
            .probe(&ProviderId::new("flaky"), Duration::from_secs(1))
            .await
            .expect("known provider");
        assert!(!result.reachable);
    }
}
