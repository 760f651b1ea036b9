//! Runtime configuration for the orchestration core.
//!
//! The core consumes a fully-populated [`EnvironmentConfig`]; where it comes from
//! (file, environment, code) is the business of [`loader::ConfigLoader`] or the
//! embedding application.

use crate::errors::{OrchestrationError, OrchestrationResult};
use crate::providers::ProviderId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

pub mod loader;

pub use loader::{ConfigLoader, ConfigSource, LoadedConfig};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PerformanceThresholds {
    pub max_response_time_ms: u64,
    pub min_success_rate: f64,
    pub max_error_rate: f64,
    pub health_check_timeout_ms: u64,
}

impl Default for PerformanceThresholds {
    fn default() -> Self {
        Self {
            max_response_time_ms: 30_000,
            min_success_rate: 0.95,
            max_error_rate: 0.05,
            health_check_timeout_ms: 10_000,
        }
    }
}

impl PerformanceThresholds {
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

/// Configuration for retry behavior with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (excluding initial attempt)
    pub max_retries: u32,
    pub base_delay_ms: u64,
    /// Cap applied before jitter
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Case-insensitive substrings that mark an error as transient
    pub retryable_error_signatures: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            retryable_error_signatures: [
                "rate limit",
                "rate_limit",
                "429",
                "too many requests",
                "timeout",
                "timed out",
                "econnreset",
                "connection reset",
                "500",
                "502",
                "503",
                "504",
                "internal server error",
                "bad gateway",
                "service unavailable",
                "overloaded",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_signatures<I, S>(mut self, signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_error_signatures = signatures.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Step sizes for the success/error rate nudges. Failures move the rates
/// further than successes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthNudges {
    pub call_success: f64,
    pub call_failure: f64,
    pub probe_success: f64,
    pub probe_failure: f64,
}

impl Default for HealthNudges {
    fn default() -> Self {
        Self {
            call_success: 0.05,
            call_failure: 0.1,
            probe_success: 0.1,
            probe_failure: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Fraction of the model window kept free, 0.1 = 10%
    pub safety_margin: f64,
    pub inter_chunk_delay_ms: u64,
    /// Fixed extra output tokens granted to every chunk
    pub output_reserve_tokens: u32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            safety_margin: 0.1,
            inter_chunk_delay_ms: 1_000,
            output_reserve_tokens: 500,
        }
    }
}

impl ChunkingConfig {
    pub fn inter_chunk_delay(&self) -> Duration {
        Duration::from_millis(self.inter_chunk_delay_ms)
    }
}

/// Optional dispatch gates for one provider. `None` means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderLimits {
    pub requests_per_minute: Option<u32>,
    pub daily_request_quota: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub primary_provider: ProviderId,
    pub fallback_providers: Vec<ProviderId>,
    pub health_check_interval_ms: u64,
    pub auto_fallback_enabled: bool,
    /// Consecutive unhealthy probes of the primary before the probe loop promotes a fallback
    pub unhealthy_probe_threshold: u32,
    pub fallback_history_capacity: usize,
    pub performance_thresholds: PerformanceThresholds,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub health_nudges: HealthNudges,
    pub chunking: ChunkingConfig,
    /// Error substrings that mean the provider's quota is spent
    pub quota_error_signatures: Vec<String>,
    pub provider_limits: BTreeMap<ProviderId, ProviderLimits>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            primary_provider: ProviderId::new("primary-llm"),
            fallback_providers: vec![
                ProviderId::new("enterprise-gateway"),
                ProviderId::new("community-inference"),
                ProviderId::new("local-inference"),
            ],
            health_check_interval_ms: 30_000,
            auto_fallback_enabled: true,
            unhealthy_probe_threshold: 1,
            fallback_history_capacity: 100,
            performance_thresholds: PerformanceThresholds::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            health_nudges: HealthNudges::default(),
            chunking: ChunkingConfig::default(),
            quota_error_signatures: vec![
                "insufficient_quota".to_string(),
                "quota exceeded".to_string(),
                "exceeded your current quota".to_string(),
                "billing".to_string(),
            ],
            provider_limits: BTreeMap::new(),
        }
    }
}

impl EnvironmentConfig {
    pub fn new(primary: impl Into<ProviderId>) -> Self {
        Self {
            primary_provider: primary.into(),
            fallback_providers: Vec::new(),
            ..Self::default()
        }
    }

    pub fn with_fallbacks<I, P>(mut self, fallbacks: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ProviderId>,
    {
        self.fallback_providers = fallbacks.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_auto_fallback(mut self, enabled: bool) -> Self {
        self.auto_fallback_enabled = enabled;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn with_limits(mut self, provider: impl Into<ProviderId>, limits: ProviderLimits) -> Self {
        self.provider_limits.insert(provider.into(), limits);
        self
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Primary followed by fallbacks in declaration order.
    pub fn ordered_providers(&self) -> Vec<ProviderId> {
        std::iter::once(self.primary_provider.clone())
            .chain(self.fallback_providers.iter().cloned())
            .collect()
    }

    pub fn limits_for(&self, provider: &ProviderId) -> ProviderLimits {
        self.provider_limits
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    /// Structural problems that make this config unusable.
    pub fn structural_errors(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.primary_provider.as_str().trim().is_empty() {
            errors.push("primary provider id is empty".to_string());
        }

        let mut seen = HashSet::new();
        for fallback in &self.fallback_providers {
            if fallback == &self.primary_provider {
                errors.push(format!(
                    "fallback list contains the primary provider '{fallback}'"
                ));
            }
            if !seen.insert(fallback) {
                errors.push(format!("fallback provider '{fallback}' is listed twice"));
            }
        }

        let thresholds = &self.performance_thresholds;
        for (name, value) in [
            ("min_success_rate", thresholds.min_success_rate),
            ("max_error_rate", thresholds.max_error_rate),
            ("chunking.safety_margin", self.chunking.safety_margin),
        ] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(format!("{name} must be within [0, 1], got {value}"));
            }
        }
        if thresholds.max_response_time_ms == 0 {
            errors.push("max_response_time_ms must be greater than zero".to_string());
        }
        if thresholds.health_check_timeout_ms == 0 {
            errors.push("health_check_timeout_ms must be greater than zero".to_string());
        }

        if self.retry.backoff_multiplier.is_nan() || self.retry.backoff_multiplier < 1.0 {
            errors.push(format!(
                "retry.backoff_multiplier must be >= 1.0, got {}",
                self.retry.backoff_multiplier
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            errors.push("retry.base_delay_ms exceeds retry.max_delay_ms".to_string());
        }

        if self.circuit_breaker.failure_threshold == 0 {
            errors.push("circuit_breaker.failure_threshold must be at least 1".to_string());
        }
        if self.circuit_breaker.half_open_max_calls == 0 {
            errors.push("circuit_breaker.half_open_max_calls must be at least 1".to_string());
        }
        if self.unhealthy_probe_threshold == 0 {
            errors.push("unhealthy_probe_threshold must be at least 1".to_string());
        }
        if self.health_check_interval_ms == 0 {
            errors.push("health_check_interval_ms must be greater than zero".to_string());
        }

        let nudges = &self.health_nudges;
        for (name, value) in [
            ("health_nudges.call_success", nudges.call_success),
            ("health_nudges.call_failure", nudges.call_failure),
            ("health_nudges.probe_success", nudges.probe_success),
            ("health_nudges.probe_failure", nudges.probe_failure),
        ] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(format!("{name} must be within [0, 1], got {value}"));
            }
        }

        errors
    }

    pub fn validate(&self) -> OrchestrationResult<()> {
        let errors = self.structural_errors();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(OrchestrationError::Configuration(errors.join("; ")))
        }
    }
}
