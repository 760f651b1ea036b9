pub mod ask;
pub mod config;
pub mod health;

pub use ask::AskCommand;
pub use config::ConfigCommand;
pub use health::HealthCommand;

use anyhow::{Context, Result};
use llm_failover::{
    CallOrchestrator, EndpointConfig, LoadedConfig, OpenAiCompatibleProvider, ProviderCatalog,
};
use std::sync::Arc;
use tracing::debug;

/// Register one OpenAI-compatible adapter per configured endpoint, falling
/// back to the reference endpoints when the config declares none.
pub fn build_catalog(loaded: &LoadedConfig) -> Result<ProviderCatalog> {
    let endpoints: Vec<_> = if loaded.endpoints.is_empty() {
        EndpointConfig::reference_endpoints()
    } else {
        loaded
            .endpoints
            .iter()
            .map(|(id, endpoint)| (id.clone(), endpoint.clone()))
            .collect()
    };

    let mut catalog = ProviderCatalog::new();
    for (id, endpoint) in endpoints {
        debug!(provider = %id, base_url = %endpoint.base_url, "Registering endpoint");
        let adapter = OpenAiCompatibleProvider::new(id.clone(), endpoint)
            .with_context(|| format!("invalid endpoint for provider '{id}'"))?;
        catalog.register(Arc::new(adapter))?;
    }
    Ok(catalog)
}

pub fn build_orchestrator(loaded: &LoadedConfig) -> Result<CallOrchestrator> {
    let catalog = build_catalog(loaded)?;
    Ok(CallOrchestrator::new(catalog, loaded.orchestration.clone())?)
}
