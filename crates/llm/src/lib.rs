//! Multi-provider LLM call orchestration with health tracking, circuit
//! breaking, retries and automatic failover.
//!
//! A [`CallOrchestrator`] owns a [`ProviderCatalog`] of adapters and an
//! [`EnvironmentConfig`] naming the primary provider and its ordered fallbacks.
//! Every call goes through the same pipeline: pre-dispatch gates (credentials,
//! circuit breaker, rate limit, quota), the retry executor, and on failure a
//! promotion of the next healthy fallback.

pub mod chunking;
pub mod circuit_breaker;
pub mod config;
pub mod errors;
pub mod orchestration;
pub mod providers;
pub mod retry;

pub use chunking::{effective_input_limit, estimate_tokens, ContextChunker, TokenEstimator};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use config::{
    ChunkingConfig, CircuitBreakerConfig, ConfigLoader, ConfigSource, EnvironmentConfig, HealthNudges,
    LoadedConfig, PerformanceThresholds, ProviderLimits, RetryConfig,
};
pub use errors::{OrchestrationError, OrchestrationResult};
pub use orchestration::{
    CallOrchestrator, ConfigValidationReport, ExecuteOptions, FallbackCoordinator, FallbackEvent,
    HealthStatus, ProviderHealth, ProviderHealthTracker,
};
pub use providers::{
    ChatMessage, EndpointConfig, MessageRole, OpenAiCompatibleProvider, PreparedInput,
    ProbeResult, ProviderAdapter, ProviderCallError, ProviderCatalog, ProviderDescriptor,
    ProviderId, ProviderSession,
};
