use crate::chunking::ContextChunker;
use crate::config::{EnvironmentConfig, ProviderLimits};
use crate::errors::{OrchestrationError, OrchestrationResult};
use crate::providers::{PreparedInput, ProviderAdapter, ProviderCatalog, ProviderId, ProviderSession};
use crate::retry::{execute_with_retry, RetryFailure};
use common::{OperationTimer, RequestContext};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

pub mod diagnostics;
pub mod fallback;
pub mod gates;
pub mod health_monitor;

pub use diagnostics::ConfigValidationReport;
pub use fallback::{FallbackCoordinator, FallbackEvent, FallbackSettings};
pub use gates::DispatchGates;
pub use health_monitor::{HealthStatus, ProviderHealth, ProviderHealthTracker};

/// Per-call overrides for [`CallOrchestrator::execute_with`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Pin the call to one provider; gate failures become terminal
    pub strict_provider: Option<ProviderId>,
    pub cancel: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn strict(provider: impl Into<ProviderId>) -> Self {
        Self {
            strict_provider: Some(provider.into()),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Entry point for provider calls: gates each dispatch, retries transient
/// failures and switches providers when the active one cannot serve.
pub struct CallOrchestrator {
    config: RwLock<EnvironmentConfig>,
    catalog: Arc<ProviderCatalog>,
    health: Arc<ProviderHealthTracker>,
    coordinator: Arc<FallbackCoordinator>,
    gates: DispatchGates,
    sessions: DashMap<ProviderId, Arc<OnceCell<ProviderSession>>>,
    strict: RwLock<Option<ProviderId>>,
    chunker: ContextChunker,
    shutdown: CancellationToken,
}

impl CallOrchestrator {
    pub fn new(catalog: ProviderCatalog, config: EnvironmentConfig) -> OrchestrationResult<Self> {
        config.validate()?;

        let catalog = Arc::new(catalog);
        let health = Arc::new(ProviderHealthTracker::new(
            config.performance_thresholds.clone(),
            config.health_nudges.clone(),
            config.circuit_breaker.clone(),
        ));
        let coordinator = Arc::new(FallbackCoordinator::new(
            catalog.clone(),
            health.clone(),
            &config,
        ));

        info!(
            primary = %config.primary_provider,
            fallbacks = config.fallback_providers.len(),
            registered = catalog.len(),
            "🚀 Initializing call orchestrator"
        );

        Ok(Self {
            config: RwLock::new(config),
            catalog,
            health,
            coordinator,
            gates: DispatchGates::new(),
            sessions: DashMap::new(),
            strict: RwLock::new(None),
            chunker: ContextChunker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_chunker(mut self, chunker: ContextChunker) -> Self {
        self.chunker = chunker;
        self
    }

    /// Start the periodic health probes. Must be called inside a tokio runtime.
    pub fn start(&self) {
        self.coordinator.start_monitoring();
    }

    /// Stop the probes and cancel in-flight calls that use the default token.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.coordinator.stop_monitoring();
        info!("Call orchestrator shut down");
    }

    pub async fn execute<T, F, Fut>(&self, operation_name: &str, operation: F) -> OrchestrationResult<T>
    where
        F: Fn(ProviderSession) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.execute_with(operation_name, ExecuteOptions::default(), operation)
            .await
    }

    /// Run `operation` against the active provider (or the strict one),
    /// switching providers on failure until one succeeds or none is left.
    pub async fn execute_with<T, F, Fut>(
        &self,
        operation_name: &str,
        options: ExecuteOptions,
        operation: F,
    ) -> OrchestrationResult<T>
    where
        F: Fn(ProviderSession) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let request = RequestContext::new();
        let span = info_span!("execute", request_id = %request.request_id, operation = operation_name);

        async move {
            let mut timer = OperationTimer::new(operation_name);
            let result = self.run(operation_name, &options, &operation).await;
            timer.add_field("request_id", &request.request_id);
            timer.finish_with_result(result.as_ref());
            result
        }
        .instrument(span)
        .await
    }

    async fn run<T, F, Fut>(
        &self,
        operation_name: &str,
        options: &ExecuteOptions,
        operation: &F,
    ) -> OrchestrationResult<T>
    where
        F: Fn(ProviderSession) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let config = self.config.read().clone();
        let cancel = options
            .cancel
            .clone()
            .unwrap_or_else(|| self.shutdown.child_token());
        let strict = options
            .strict_provider
            .clone()
            .or_else(|| self.strict.read().clone());

        let mut dispatched: Vec<ProviderId> = Vec::new();
        let mut examined: Vec<ProviderId> = Vec::new();
        let mut last_error: Option<String> = None;

        for _ in 0..config.ordered_providers().len().max(1) {
            if cancel.is_cancelled() {
                return Err(OrchestrationError::Cancelled);
            }

            let provider = match &strict {
                Some(pinned) => pinned.clone(),
                None => self.coordinator.active_provider(),
            };
            if dispatched.contains(&provider) {
                break;
            }
            dispatched.push(provider.clone());

            let failure = match self
                .dispatch(&provider, operation_name, &config, &cancel, operation)
                .await
            {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if failure.is_terminal() {
                return Err(failure);
            }
            if strict.is_some() && matches!(failure, OrchestrationError::MissingCredentials { .. }) {
                return Err(failure);
            }

            let message = failure.to_string();
            self.health.note_error(&provider, &message);
            last_error = Some(message.clone());

            if strict.is_some() {
                warn!(provider = %provider, "Strict mode: not switching providers");
                return Err(OrchestrationError::StrictModeViolation {
                    provider,
                    reason: message,
                });
            }
            if !config.auto_fallback_enabled {
                return Err(OrchestrationError::FallbackDisabled {
                    provider,
                    last_error: message,
                });
            }

            if failure.is_gate_failure() {
                info!(provider = %provider, "Provider gated, attempting fallback: {}", message);
            } else {
                warn!(provider = %provider, "⚠️ Provider failed, attempting fallback: {}", message);
            }
            let decision = self
                .coordinator
                .fallback_from(&provider, &format!("{operation_name}: {message}"), &dispatched)
                .await;
            for id in decision.examined {
                if !examined.contains(&id) {
                    examined.push(id);
                }
            }
            if !decision.promoted {
                break;
            }
        }

        let mut attempted = dispatched;
        for id in examined {
            if !attempted.contains(&id) {
                attempted.push(id);
            }
        }
        Err(OrchestrationError::NoHealthyFallback {
            attempted,
            last_error: last_error.unwrap_or_else(|| "no provider could be dispatched".to_string()),
        })
    }

    /// One provider: gates, then the retry loop.
    async fn dispatch<T, F, Fut>(
        &self,
        provider: &ProviderId,
        operation_name: &str,
        config: &EnvironmentConfig,
        cancel: &CancellationToken,
        operation: &F,
    ) -> OrchestrationResult<T>
    where
        F: Fn(ProviderSession) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let adapter = self.catalog.get(provider)?;
        self.catalog.check_configured(provider)?;
        let session = self.session(provider, adapter).await?;

        let limits = config.limits_for(provider);
        let limits = &limits;
        let quota_signatures = config.quota_error_signatures.as_slice();
        let outcome = execute_with_retry(&config.retry, operation_name, provider, cancel, |attempt| {
            self.attempt(provider, attempt, limits, quota_signatures, session.clone(), operation)
        })
        .await;

        match outcome {
            Ok(value) => Ok(value),
            Err(RetryFailure::Cancelled { .. }) => Err(OrchestrationError::Cancelled),
            Err(RetryFailure::Exhausted {
                attempts,
                retryable,
                last_error,
            }) => {
                if let Some(e) = last_error.downcast_ref::<OrchestrationError>() {
                    return Err(e.clone());
                }
                Err(OrchestrationError::ProviderFailed {
                    provider: provider.clone(),
                    attempts,
                    message: format!("{last_error:#}"),
                    retryable,
                })
            }
        }
    }

    /// A single call, gated by the circuit and the dispatch gates.
    async fn attempt<T, F, Fut>(
        &self,
        provider: &ProviderId,
        attempt: u32,
        limits: &ProviderLimits,
        quota_signatures: &[String],
        session: ProviderSession,
        operation: &F,
    ) -> anyhow::Result<T>
    where
        F: Fn(ProviderSession) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if !self.health.allow(provider) {
            debug!(provider = %provider, attempt, "Circuit open, skipping dispatch");
            return Err(OrchestrationError::CircuitOpen(provider.clone()).into());
        }
        let admission = Admission::new(&self.health, provider);
        self.gates.acquire(provider, limits)?;

        let started = Instant::now();
        let result = operation(session).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let error = match result {
            Ok(value) => {
                admission.settle();
                self.health.record_outcome(provider, true, elapsed_ms);
                return Ok(value);
            }
            Err(e) => e,
        };

        let terminal = error
            .downcast_ref::<OrchestrationError>()
            .is_some_and(OrchestrationError::is_terminal);
        if terminal {
            return Err(error);
        }

        admission.settle();
        self.health.record_outcome(provider, false, elapsed_ms);
        if matches_signature(&error, quota_signatures) {
            warn!(provider = %provider, "Quota exhausted: {:#}", error);
            self.gates.mark_exhausted(provider);
            return Err(OrchestrationError::QuotaExhausted(provider.clone()).into());
        }
        Err(error)
    }

    /// Connect on first use; later calls reuse the session.
    async fn session(
        &self,
        provider: &ProviderId,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> OrchestrationResult<ProviderSession> {
        let cell = self
            .sessions
            .entry(provider.clone())
            .or_default()
            .value()
            .clone();

        cell.get_or_try_init(|| async {
            if let Err(e) = adapter.connect().await {
                self.health.record_outcome(provider, false, 0);
                return Err(OrchestrationError::ProviderFailed {
                    provider: provider.clone(),
                    attempts: 1,
                    message: format!("connection failed: {e:#}"),
                    retryable: false,
                });
            }
            info!(provider = %provider, "🔗 Provider session established");
            Ok(ProviderSession::new(provider.clone(), adapter.clone()))
        })
        .await
        .cloned()
    }

    pub async fn complete(
        &self,
        operation_name: &str,
        input: PreparedInput,
        max_output_tokens: u32,
    ) -> OrchestrationResult<String> {
        self.complete_with(operation_name, ExecuteOptions::default(), input, max_output_tokens)
            .await
    }

    /// Send a prompt, chunking it when it exceeds the serving provider's window.
    pub async fn complete_with(
        &self,
        operation_name: &str,
        options: ExecuteOptions,
        input: PreparedInput,
        max_output_tokens: u32,
    ) -> OrchestrationResult<String> {
        let chunking = self.config.read().chunking.clone();
        let cancel = options
            .cancel
            .clone()
            .unwrap_or_else(|| self.shutdown.child_token());
        let options = ExecuteOptions {
            cancel: Some(cancel.clone()),
            ..options
        };

        let chunker = &self.chunker;
        let input = &input;
        let chunking = &chunking;
        let cancel = &cancel;
        self.execute_with(operation_name, options, move |session: ProviderSession| async move {
            chunker
                .complete_prompt(
                    session.adapter().as_ref(),
                    input,
                    max_output_tokens,
                    chunking,
                    cancel,
                )
                .await
        })
        .await
    }

    /// Pin every subsequent call to `provider`, or lift the pin with `None`.
    #[instrument(skip(self))]
    pub fn set_strict_provider(&self, provider: Option<ProviderId>) -> OrchestrationResult<()> {
        if let Some(id) = &provider {
            if !self.catalog.contains(id) {
                return Err(OrchestrationError::UnsupportedProvider(id.clone()));
            }
        }
        match &provider {
            Some(id) => info!(provider = %id, "Strict provider mode enabled"),
            None => info!("Strict provider mode disabled"),
        }
        *self.strict.write() = provider;
        Ok(())
    }

    pub fn strict_provider(&self) -> Option<ProviderId> {
        self.strict.read().clone()
    }

    pub fn active_provider(&self) -> ProviderId {
        self.coordinator.active_provider()
    }

    /// Trigger a promotion away from the current primary.
    pub async fn trigger_fallback(&self, reason: &str) -> bool {
        self.coordinator.trigger_fallback(reason).await
    }

    pub fn provider_health(&self, provider: &ProviderId) -> ProviderHealth {
        self.health.health(provider)
    }

    /// Health of every configured provider plus any other provider seen so far.
    pub fn all_provider_health(&self) -> BTreeMap<ProviderId, ProviderHealth> {
        for id in self.coordinator.ordered_providers() {
            self.health.health(&id);
        }
        self.health.all()
    }

    pub fn fallback_history(&self) -> Vec<FallbackEvent> {
        self.coordinator.history()
    }

    /// Healthiest provider in failover order; ties keep the earlier one.
    pub fn recommended_provider(&self) -> Option<ProviderId> {
        self.health
            .select_best(&self.coordinator.ordered_providers())
    }

    pub async fn run_health_check(&self) -> Vec<(ProviderId, HealthStatus)> {
        self.coordinator.run_health_probes().await
    }

    /// Clear health, breaker and gate state for one provider or all of them.
    pub fn reset_provider_health(&self, provider: Option<&ProviderId>) {
        self.health.reset(provider);
        self.gates.reset(provider);
    }

    /// Validate and apply a new configuration. Provider order and breakers are
    /// rebuilt; the fallback history is kept; a running probe loop is restarted.
    #[instrument(skip(self, config), fields(primary = %config.primary_provider))]
    pub fn update_configuration(&self, config: EnvironmentConfig) -> OrchestrationResult<()> {
        config.validate()?;

        self.health.update_configuration(
            config.performance_thresholds.clone(),
            config.health_nudges.clone(),
            config.circuit_breaker.clone(),
        );
        self.coordinator.update(&config);
        *self.config.write() = config;

        if self.coordinator.is_monitoring() {
            self.coordinator.stop_monitoring();
            self.coordinator.start_monitoring();
        }
        info!("Configuration updated");
        Ok(())
    }

    pub fn validate_configuration(&self) -> ConfigValidationReport {
        diagnostics::validate_configuration(&self.current_order_config(), &self.catalog, &self.health)
    }

    pub fn generate_configuration_template(&self) -> String {
        diagnostics::generate_configuration_template(&self.current_order_config(), &self.catalog)
    }

    /// Stored configuration with the provider order as promotions left it.
    fn current_order_config(&self) -> EnvironmentConfig {
        let mut config = self.config.read().clone();
        let mut order = self.coordinator.ordered_providers().into_iter();
        if let Some(primary) = order.next() {
            config.primary_provider = primary;
            config.fallback_providers = order.collect();
        }
        config
    }

    /// Multi-line summary of every provider for terminal output.
    pub fn status_report(&self) -> String {
        let mut report = String::from("📊 Provider Status\n");
        let active = self.active_provider();
        for (id, health) in self.all_provider_health() {
            let marker = if id == active { "*" } else { " " };
            report.push_str(&format!(
                "{marker} {id}: {:?} (success {:.1}%, {}ms, circuit {})\n",
                health.status,
                health.success_rate * 100.0,
                health.response_time_ms,
                self.health.circuit_info(&id)
            ));
        }
        report.push_str(&format!("Fallback events: {}\n", self.fallback_history().len()));
        report
    }

    pub fn config(&self) -> EnvironmentConfig {
        self.config.read().clone()
    }

    pub fn catalog(&self) -> &Arc<ProviderCatalog> {
        &self.catalog
    }

    pub fn health_tracker(&self) -> &Arc<ProviderHealthTracker> {
        &self.health
    }

    pub fn coordinator(&self) -> &Arc<FallbackCoordinator> {
        &self.coordinator
    }
}

/// A call admitted by the circuit breaker. Dropped without `settle` (gate
/// refusal, terminal error, cancellation) it hands its half-open slot back.
struct Admission<'a> {
    health: &'a ProviderHealthTracker,
    provider: &'a ProviderId,
    settled: bool,
}

impl<'a> Admission<'a> {
    fn new(health: &'a ProviderHealthTracker, provider: &'a ProviderId) -> Self {
        Self {
            health,
            provider,
            settled: false,
        }
    }

    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.health.release(self.provider);
        }
    }
}

impl Drop for CallOrchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn matches_signature(error: &anyhow::Error, signatures: &[String]) -> bool {
    let text = format!("{error:#}").to_lowercase();
    signatures
        .iter()
        .any(|signature| text.contains(&signature.to_lowercase()))
}
