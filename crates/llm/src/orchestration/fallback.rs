use super::health_monitor::{HealthStatus, ProviderHealthTracker};
use crate::config::EnvironmentConfig;
use crate::providers::{ProviderCatalog, ProviderId};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// One attempted promotion, successful or not.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallbackEvent {
    pub timestamp: DateTime<Utc>,
    pub from_provider: ProviderId,
    pub to_provider: ProviderId,
    pub reason: String,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub struct FallbackSettings {
    pub auto_fallback_enabled: bool,
    pub unhealthy_probe_threshold: u32,
    pub health_check_interval: Duration,
    pub probe_timeout: Duration,
    pub history_capacity: usize,
}

impl From<&EnvironmentConfig> for FallbackSettings {
    fn from(config: &EnvironmentConfig) -> Self {
        Self {
            auto_fallback_enabled: config.auto_fallback_enabled,
            unhealthy_probe_threshold: config.unhealthy_probe_threshold.max(1),
            health_check_interval: config.health_check_interval(),
            probe_timeout: config.performance_thresholds.health_check_timeout(),
            history_capacity: config.fallback_history_capacity,
        }
    }
}

/// Outcome of one promotion pass.
#[derive(Debug, Clone, Default)]
pub(crate) struct FallbackDecision {
    pub promoted: bool,
    /// Every fallback looked at, including those skipped as unhealthy
    pub examined: Vec<ProviderId>,
}

#[derive(Debug)]
struct CoordinatorState {
    primary: ProviderId,
    fallbacks: Vec<ProviderId>,
    history: VecDeque<FallbackEvent>,
}

impl CoordinatorState {
    fn record(&mut self, event: FallbackEvent, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.history.len() >= capacity {
            self.history.pop_front();
        }
        self.history.push_back(event);
    }
}

struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the ordered provider list and performs primary promotion.
///
/// The primary and the event log share one lock, so readers never observe a
/// half-finished promotion and events are appended in transition order.
/// Candidates are probed without any lock held; a promotion only lands if the
/// primary is still the one its caller observed.
pub struct FallbackCoordinator {
    catalog: Arc<ProviderCatalog>,
    health: Arc<ProviderHealthTracker>,
    state: RwLock<CoordinatorState>,
    settings: RwLock<FallbackSettings>,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl FallbackCoordinator {
    pub fn new(
        catalog: Arc<ProviderCatalog>,
        health: Arc<ProviderHealthTracker>,
        config: &EnvironmentConfig,
    ) -> Self {
        Self {
            catalog,
            health,
            state: RwLock::new(CoordinatorState {
                primary: config.primary_provider.clone(),
                fallbacks: config.fallback_providers.clone(),
                history: VecDeque::new(),
            }),
            settings: RwLock::new(FallbackSettings::from(config)),
            monitor: Mutex::new(None),
        }
    }

    pub fn active_provider(&self) -> ProviderId {
        self.state.read().primary.clone()
    }

    pub fn fallback_providers(&self) -> Vec<ProviderId> {
        self.state.read().fallbacks.clone()
    }

    /// Primary followed by the fallbacks in their current order.
    pub fn ordered_providers(&self) -> Vec<ProviderId> {
        let state = self.state.read();
        std::iter::once(state.primary.clone())
            .chain(state.fallbacks.iter().cloned())
            .collect()
    }

    pub fn history(&self) -> Vec<FallbackEvent> {
        self.state.read().history.iter().cloned().collect()
    }

    pub fn settings(&self) -> FallbackSettings {
        self.settings.read().clone()
    }

    /// Promote the first viable fallback over the primary observed right now.
    ///
    /// The primary is captured when this is called, not when the future first
    /// runs: if another promotion wins in between, this one reports success
    /// without promoting again.
    pub fn trigger_fallback(
        &self,
        reason: impl Into<String>,
    ) -> impl Future<Output = bool> + Send + '_ {
        let observed = self.active_provider();
        let reason = reason.into();
        async move { self.fallback_from(&observed, &reason, &[]).await.promoted }
    }

    #[instrument(skip(self, exclude), fields(from = %observed))]
    pub(crate) async fn fallback_from(
        &self,
        observed: &ProviderId,
        reason: &str,
        exclude: &[ProviderId],
    ) -> FallbackDecision {
        let mut decision = FallbackDecision::default();

        let candidates = {
            let state = self.state.read();
            if &state.primary != observed {
                debug!(current = %state.primary, "Primary already switched by a concurrent promotion");
                decision.promoted = true;
                return decision;
            }
            state.fallbacks.clone()
        };
        let settings = self.settings();

        for candidate in candidates {
            if exclude.contains(&candidate) {
                continue;
            }
            decision.examined.push(candidate.clone());

            if self.health.status(&candidate) == HealthStatus::Unhealthy {
                debug!(candidate = %candidate, "Skipping unhealthy fallback");
                continue;
            }

            let status = match self.catalog.probe(&candidate, settings.probe_timeout).await {
                Ok(probe) => {
                    self.health
                        .record_probe(&candidate, probe.reachable, probe.response_time_ms)
                }
                Err(e) => {
                    warn!(candidate = %candidate, "Cannot probe fallback: {}", e);
                    HealthStatus::Unhealthy
                }
            };

            let mut state = self.state.write();
            if &state.primary != observed {
                debug!(current = %state.primary, "Primary switched while probing, dropping candidate");
                decision.promoted = true;
                return decision;
            }
            if !state.fallbacks.contains(&candidate) {
                debug!(candidate = %candidate, "Candidate no longer configured");
                continue;
            }
            if status != HealthStatus::Unhealthy {
                let previous = std::mem::replace(&mut state.primary, candidate.clone());
                state.fallbacks.retain(|p| p != &candidate);
                state.fallbacks.push(previous.clone());
                state.record(
                    FallbackEvent {
                        timestamp: Utc::now(),
                        from_provider: previous.clone(),
                        to_provider: candidate.clone(),
                        reason: reason.to_string(),
                        success: true,
                    },
                    settings.history_capacity,
                );
                info!(from = %previous, to = %candidate, reason, "🔀 Promoted fallback provider to primary");
                decision.promoted = true;
                return decision;
            }

            state.record(
                FallbackEvent {
                    timestamp: Utc::now(),
                    from_provider: observed.clone(),
                    to_provider: candidate.clone(),
                    reason: reason.to_string(),
                    success: false,
                },
                settings.history_capacity,
            );
            warn!(candidate = %candidate, "Fallback candidate failed re-probe");
        }

        error!(from = %observed, "🚨 No healthy fallback provider available");
        decision
    }

    /// Probe every configured provider concurrently and, when the primary has
    /// been unhealthy for enough consecutive probes, promote a fallback.
    #[instrument(skip(self))]
    pub async fn run_health_probes(&self) -> Vec<(ProviderId, HealthStatus)> {
        let observed = self.active_provider();
        let providers = self.ordered_providers();
        let settings = self.settings();
        info!("🏥 Starting health check for {} providers", providers.len());

        let probes = providers.iter().map(|id| {
            let timeout = settings.probe_timeout;
            async move { (id.clone(), self.catalog.probe(id, timeout).await) }
        });
        let results = join_all(probes).await;

        let mut statuses = Vec::with_capacity(results.len());
        for (id, result) in results {
            match result {
                Ok(probe) => {
                    let status =
                        self.health
                            .record_probe(&id, probe.reachable, probe.response_time_ms);
                    statuses.push((id, status));
                }
                Err(e) => warn!(provider = %id, "Skipping probe: {}", e),
            }
        }

        if settings.auto_fallback_enabled {
            let primary = self.health.health(&observed);
            if primary.status == HealthStatus::Unhealthy
                && primary.consecutive_unhealthy_probes >= settings.unhealthy_probe_threshold
            {
                warn!(
                    provider = %observed,
                    probes = primary.consecutive_unhealthy_probes,
                    "Primary unhealthy on health probe, attempting fallback"
                );
                self.fallback_from(&observed, "health probe: primary unhealthy", &[])
                    .await;
            }
        }

        statuses
    }

    /// Spawn the periodic probe loop. No-op if it is already running.
    pub fn start_monitoring(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let interval = self.settings.read().health_check_interval;
        let task = tokio::spawn(probe_loop(Arc::downgrade(self), interval, cancel.clone()));
        info!(interval_ms = interval.as_millis() as u64, "Health monitoring started");
        *monitor = Some(MonitorHandle { cancel, task });
    }

    pub fn stop_monitoring(&self) {
        if let Some(handle) = self.monitor.lock().take() {
            handle.cancel.cancel();
            handle.task.abort();
            info!("Health monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// Replace provider order and settings. The event log is kept.
    pub fn update(&self, config: &EnvironmentConfig) {
        *self.settings.write() = FallbackSettings::from(config);
        let mut state = self.state.write();
        state.primary = config.primary_provider.clone();
        state.fallbacks = config.fallback_providers.clone();
        let capacity = config.fallback_history_capacity;
        while state.history.len() > capacity {
            state.history.pop_front();
        }
    }
}

impl Drop for FallbackCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.monitor.get_mut().take() {
            handle.cancel.cancel();
            handle.task.abort();
        }
    }
}

async fn probe_loop(
    weak: Weak<FallbackCoordinator>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(coordinator) = weak.upgrade() else {
            break;
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = coordinator.run_health_probes() => {}
        }
    }
    debug!("Health probe loop exited");
}
