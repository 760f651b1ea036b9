use crate::circuit_breaker::{CircuitBreaker, CircuitState, StateObserver};
use crate::config::{CircuitBreakerConfig, HealthNudges, PerformanceThresholds};
use crate::providers::ProviderId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Below this success rate a provider is unhealthy regardless of thresholds.
pub const UNHEALTHY_SUCCESS_RATE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Rolling health record for one provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderHealth {
    pub provider: ProviderId,
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub consecutive_unhealthy_probes: u32,
    pub circuit_state: CircuitState,
    pub last_error: Option<String>,
}

impl ProviderHealth {
    pub fn new(provider: ProviderId) -> Self {
        Self {
            provider,
            status: HealthStatus::Healthy,
            response_time_ms: 0,
            success_rate: 1.0,
            error_rate: 0.0,
            last_checked_at: None,
            consecutive_failures: 0,
            consecutive_unhealthy_probes: 0,
            circuit_state: CircuitState::Closed,
            last_error: None,
        }
    }

    fn nudge(&mut self, success: bool, up: f64, down: f64) {
        if success {
            self.success_rate = (self.success_rate + up).min(1.0);
            self.error_rate = (self.error_rate - up).max(0.0);
        } else {
            self.success_rate = (self.success_rate - down).max(0.0);
            self.error_rate = (self.error_rate + down).min(1.0);
        }
    }

    fn refresh_status(&mut self, thresholds: &PerformanceThresholds) {
        self.status = derive_status(self.success_rate, self.error_rate, thresholds);
    }
}

pub fn derive_status(
    success_rate: f64,
    error_rate: f64,
    thresholds: &PerformanceThresholds,
) -> HealthStatus {
    if success_rate >= thresholds.min_success_rate && error_rate <= thresholds.max_error_rate {
        HealthStatus::Healthy
    } else if success_rate < UNHEALTHY_SUCCESS_RATE {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    }
}

#[derive(Debug, Clone)]
struct TrackerSettings {
    thresholds: PerformanceThresholds,
    nudges: HealthNudges,
    breaker: CircuitBreakerConfig,
}

type Records = Arc<DashMap<ProviderId, Arc<Mutex<ProviderHealth>>>>;

fn record_in(records: &Records, provider: &ProviderId) -> Arc<Mutex<ProviderHealth>> {
    records
        .entry(provider.clone())
        .or_insert_with(|| Arc::new(Mutex::new(ProviderHealth::new(provider.clone()))))
        .value()
        .clone()
}

/// Health records and circuit breakers, one of each per provider.
///
/// Every provider has its own mutex for each; when both are needed the
/// breaker is locked first (its observer writes into the health record).
pub struct ProviderHealthTracker {
    settings: RwLock<TrackerSettings>,
    records: Records,
    breakers: DashMap<ProviderId, Arc<Mutex<CircuitBreaker>>>,
}

impl ProviderHealthTracker {
    pub fn new(
        thresholds: PerformanceThresholds,
        nudges: HealthNudges,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        Self {
            settings: RwLock::new(TrackerSettings {
                thresholds,
                nudges,
                breaker,
            }),
            records: Arc::new(DashMap::new()),
            breakers: DashMap::new(),
        }
    }

    fn record(&self, provider: &ProviderId) -> Arc<Mutex<ProviderHealth>> {
        record_in(&self.records, provider)
    }

    fn observer(&self) -> StateObserver {
        let records = self.records.clone();
        Arc::new(move |provider: &ProviderId, state: CircuitState| {
            info!(provider = %provider, state = %state, "Circuit state changed");
            record_in(&records, provider).lock().circuit_state = state;
        })
    }

    fn breaker(&self, provider: &ProviderId) -> Arc<Mutex<CircuitBreaker>> {
        if let Some(existing) = self.breakers.get(provider) {
            return existing.value().clone();
        }
        let config = self.settings.read().breaker.clone();
        let observer = self.observer();
        self.breakers
            .entry(provider.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(CircuitBreaker::new(
                    provider.clone(),
                    &config,
                    Some(observer),
                )))
            })
            .value()
            .clone()
    }

    /// Circuit gate for one dispatch attempt.
    pub fn allow(&self, provider: &ProviderId) -> bool {
        self.breaker(provider).lock().allow()
    }

    /// Undo an `allow` whose call produced no outcome.
    pub fn release(&self, provider: &ProviderId) {
        self.breaker(provider).lock().release()
    }

    pub fn circuit_state(&self, provider: &ProviderId) -> CircuitState {
        self.breaker(provider).lock().current_state()
    }

    /// Human-readable breaker summary, e.g. `OPEN (recovery in: 12s)`.
    pub fn circuit_info(&self, provider: &ProviderId) -> String {
        self.breaker(provider).lock().state_info()
    }

    /// Outcome of a real call: feeds the provider's breaker, then nudges the
    /// rates by the call step sizes.
    pub fn record_outcome(&self, provider: &ProviderId, success: bool, response_time_ms: u64) {
        {
            let breaker = self.breaker(provider);
            let mut breaker = breaker.lock();
            if success {
                breaker.on_success();
            } else {
                breaker.on_failure();
            }
        }

        let settings = self.settings.read().clone();
        let record = self.record(provider);
        let mut health = record.lock();
        health.nudge(
            success,
            settings.nudges.call_success,
            settings.nudges.call_failure,
        );
        if success {
            health.consecutive_failures = 0;
            health.last_error = None;
        } else {
            health.consecutive_failures += 1;
        }
        health.response_time_ms = response_time_ms;
        health.last_checked_at = Some(Utc::now());
        health.refresh_status(&settings.thresholds);

        debug!(
            provider = %provider,
            success,
            success_rate = health.success_rate,
            error_rate = health.error_rate,
            status = ?health.status,
            "Recorded call outcome"
        );
    }

    /// Outcome of a connectivity probe. Returns the resulting status.
    pub fn record_probe(
        &self,
        provider: &ProviderId,
        reachable: bool,
        response_time_ms: u64,
    ) -> HealthStatus {
        let settings = self.settings.read().clone();
        let record = self.record(provider);
        let mut health = record.lock();
        health.nudge(
            reachable,
            settings.nudges.probe_success,
            settings.nudges.probe_failure,
        );
        health.response_time_ms = response_time_ms;
        health.last_checked_at = Some(Utc::now());
        health.refresh_status(&settings.thresholds);

        if health.status == HealthStatus::Unhealthy {
            health.consecutive_unhealthy_probes += 1;
        } else {
            health.consecutive_unhealthy_probes = 0;
        }

        debug!(
            provider = %provider,
            reachable,
            response_time_ms,
            status = ?health.status,
            "Recorded health probe"
        );
        health.status
    }

    pub fn note_error(&self, provider: &ProviderId, message: impl Into<String>) {
        self.record(provider).lock().last_error = Some(message.into());
    }

    /// Snapshot of one provider's record, created on first observation.
    pub fn health(&self, provider: &ProviderId) -> ProviderHealth {
        self.record(provider).lock().clone()
    }

    pub fn status(&self, provider: &ProviderId) -> HealthStatus {
        self.record(provider).lock().status
    }

    pub fn all(&self) -> BTreeMap<ProviderId, ProviderHealth> {
        let records: Vec<_> = self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        records
            .into_iter()
            .map(|record| {
                let health = record.lock().clone();
                (health.provider.clone(), health)
            })
            .collect()
    }

    /// Mean of latency, success, error and circuit sub-scores, each in [0, 1].
    pub fn score(&self, provider: &ProviderId) -> f64 {
        let circuit_closed = self.circuit_state(provider) == CircuitState::Closed;
        let max_response = self.settings.read().thresholds.max_response_time_ms.max(1) as f64;
        let health = self.health(provider);

        let latency = (1.0 - health.response_time_ms as f64 / max_response).max(0.0);
        let circuit = if circuit_closed { 1.0 } else { 0.0 };
        (latency + health.success_rate + (1.0 - health.error_rate) + circuit) / 4.0
    }

    /// Highest-scoring candidate; ties go to the earlier entry.
    pub fn select_best(&self, candidates: &[ProviderId]) -> Option<ProviderId> {
        let mut best: Option<(&ProviderId, f64)> = None;
        for candidate in candidates {
            let score = self.score(candidate);
            match best {
                Some((_, best_score)) if score <= best_score => {}
                _ => best = Some((candidate, score)),
            }
        }
        best.map(|(id, _)| id.clone())
    }

    /// Forget the history of one provider, or of all of them.
    pub fn reset(&self, provider: Option<&ProviderId>) {
        match provider {
            Some(id) => {
                self.breakers.remove(id);
                self.records.remove(id);
                info!(provider = %id, "Health record reset");
            }
            None => {
                self.breakers.clear();
                self.records.clear();
                info!("All health records reset");
            }
        }
    }

    /// Swap in new thresholds and rebuild every breaker in CLOSED state.
    pub fn update_configuration(
        &self,
        thresholds: PerformanceThresholds,
        nudges: HealthNudges,
        breaker: CircuitBreakerConfig,
    ) {
        *self.settings.write() = TrackerSettings {
            thresholds: thresholds.clone(),
            nudges,
            breaker,
        };
        self.breakers.clear();

        let records: Vec<_> = self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for record in records {
            let mut health = record.lock();
            health.circuit_state = CircuitState::Closed;
            health.refresh_status(&thresholds);
        }
    }

    pub fn thresholds(&self) -> PerformanceThresholds {
        self.settings.read().thresholds.clone()
    }
}

impl Default for ProviderHealthTracker {
    fn default() -> Self {
        Self::new(
            PerformanceThresholds::default(),
            HealthNudges::default(),
            CircuitBreakerConfig::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn id(s: &str) -> ProviderId {
        ProviderId::new(s)
    }

    #[rstest]
    #[case(1.0, 0.0, HealthStatus::Healthy)]
    #[case(0.95, 0.05, HealthStatus::Healthy)]
    #[case(0.9, 0.1, HealthStatus::Degraded)]
    #[case(0.99, 0.2, HealthStatus::Degraded)]
    #[case(0.69, 0.3, HealthStatus::Unhealthy)]
    #[case(0.0, 1.0, HealthStatus::Unhealthy)]
    fn test_status_derivation(
        #[case] success: f64,
        #[case] error: f64,
        #[case] expected: HealthStatus,
    ) {
        assert_eq!(
            derive_status(success, error, &PerformanceThresholds::default()),
            expected
        );
    }

    #[test]
    fn test_failures_penalized_harder_than_successes_rewarded() {
        let tracker = ProviderHealthTracker::default();
        let p = id("primary-llm");

        tracker.record_outcome(&p, false, 100);
        let after_failure = tracker.health(&p);
        assert!((after_failure.success_rate - 0.9).abs() < 1e-9);
        assert!((after_failure.error_rate - 0.1).abs() < 1e-9);
        assert_eq!(after_failure.consecutive_failures, 1);

        tracker.record_outcome(&p, true, 100);
        let after_success = tracker.health(&p);
        assert!((after_success.success_rate - 0.95).abs() < 1e-9);
        assert!((after_success.error_rate - 0.05).abs() < 1e-9);
        assert_eq!(after_success.consecutive_failures, 0);
    }

    #[test]
    fn test_probe_failures_make_provider_unhealthy() {
        let tracker = ProviderHealthTracker::default();
        let p = id("local-inference");

        assert_eq!(tracker.record_probe(&p, false, 10), HealthStatus::Degraded);
        assert_eq!(tracker.record_probe(&p, false, 10), HealthStatus::Unhealthy);
        assert_eq!(tracker.health(&p).consecutive_unhealthy_probes, 1);
        assert_eq!(tracker.record_probe(&p, false, 10), HealthStatus::Unhealthy);
        assert_eq!(tracker.health(&p).consecutive_unhealthy_probes, 2);
    }

    #[test]
    fn test_breaker_state_mirrored_into_health() {
        let breaker = CircuitBreakerConfig {
            failure_threshold: 2,
            ..CircuitBreakerConfig::default()
        };
        let tracker = ProviderHealthTracker::new(
            PerformanceThresholds::default(),
            HealthNudges::default(),
            breaker,
        );
        let p = id("enterprise-gateway");

        tracker.record_outcome(&p, false, 5);
        tracker.record_outcome(&p, false, 5);

        assert_eq!(tracker.health(&p).circuit_state, CircuitState::Open);
        assert!(!tracker.allow(&p));
    }

    #[test]
    fn test_score_and_selection() {
        let tracker = ProviderHealthTracker::default();
        let (a, b, c) = (id("a"), id("b"), id("c"));

        // fresh providers tie at the maximum score; declaration order wins
        assert!((tracker.score(&a) - 1.0).abs() < 1e-9);
        assert_eq!(tracker.select_best(&[a.clone(), b.clone()]), Some(a.clone()));

        tracker.record_outcome(&a, false, 15_000);
        let expected = (0.5 + 0.9 + 0.9 + 1.0) / 4.0;
        assert!((tracker.score(&a) - expected).abs() < 1e-9);
        assert_eq!(
            tracker.select_best(&[a.clone(), b.clone(), c.clone()]),
            Some(b)
        );
        assert_eq!(tracker.select_best(&[]), None);
    }

    #[test]
    fn test_reset_single_provider() {
        let tracker = ProviderHealthTracker::default();
        let (a, b) = (id("a"), id("b"));
        tracker.record_outcome(&a, false, 1);
        tracker.record_outcome(&b, false, 1);

        tracker.reset(Some(&a));
        assert_eq!(tracker.health(&a), ProviderHealth::new(a.clone()));
        assert_eq!(tracker.health(&b).consecutive_failures, 1);

        tracker.reset(None);
        assert!(tracker.all().is_empty());
    }

    #[test]
    fn test_update_configuration_rebuilds_breakers() {
        let tracker = ProviderHealthTracker::new(
            PerformanceThresholds::default(),
            HealthNudges::default(),
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            },
        );
        let p = id("p");
        tracker.record_outcome(&p, false, 1);
        assert_eq!(tracker.circuit_state(&p), CircuitState::Open);

        tracker.update_configuration(
            PerformanceThresholds::default(),
            HealthNudges::default(),
            CircuitBreakerConfig::default(),
        );
        assert_eq!(tracker.circuit_state(&p), CircuitState::Closed);
        assert_eq!(tracker.health(&p).circuit_state, CircuitState::Closed);
        assert!(tracker.allow(&p));
    }

    proptest! {
        #[test]
        fn prop_rates_stay_within_unit_interval(
            events in proptest::collection::vec((any::<bool>(), any::<bool>(), 0u64..120_000), 0..200)
        ) {
            let tracker = ProviderHealthTracker::default();
            let p = id("p");
            for (is_probe, ok, ms) in events {
                if is_probe {
                    tracker.record_probe(&p, ok, ms);
                } else {
                    tracker.record_outcome(&p, ok, ms);
                }
                let health = tracker.health(&p);
                prop_assert!((0.0..=1.0).contains(&health.success_rate));
                prop_assert!((0.0..=1.0).contains(&health.error_rate));
                let score = tracker.score(&p);
                prop_assert!((0.0..=1.0).contains(&score));
            }
        }
    }
}
