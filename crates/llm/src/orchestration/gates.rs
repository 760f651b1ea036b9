use crate::config::ProviderLimits;
use crate::errors::{OrchestrationError, OrchestrationResult};
use crate::providers::ProviderId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const RATE_WINDOW: Duration = Duration::from_secs(60);
const QUOTA_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
struct GateState {
    recent: VecDeque<Instant>,
    window_start: Instant,
    window_count: u32,
    exhausted: bool,
}

impl GateState {
    fn new(now: Instant) -> Self {
        Self {
            recent: VecDeque::new(),
            window_start: now,
            window_count: 0,
            exhausted: false,
        }
    }

    fn roll(&mut self, now: Instant) {
        while let Some(oldest) = self.recent.front() {
            if now.duration_since(*oldest) >= RATE_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        if now.duration_since(self.window_start) >= QUOTA_WINDOW {
            self.window_start = now;
            self.window_count = 0;
            self.exhausted = false;
        }
    }
}

/// Pre-dispatch rate-limit and quota gates, tracked per provider in memory.
#[derive(Debug, Default)]
pub struct DispatchGates {
    states: DashMap<ProviderId, Arc<Mutex<GateState>>>,
}

impl DispatchGates {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, provider: &ProviderId) -> Arc<Mutex<GateState>> {
        self.states
            .entry(provider.clone())
            .or_insert_with(|| Arc::new(Mutex::new(GateState::new(Instant::now()))))
            .value()
            .clone()
    }

    /// Check both gates and, if they pass, count one dispatch against them.
    pub fn acquire(&self, provider: &ProviderId, limits: &ProviderLimits) -> OrchestrationResult<()> {
        let now = Instant::now();
        let state = self.state(provider);
        let mut state = state.lock();
        state.roll(now);

        if state.exhausted {
            debug!(provider = %provider, "Quota gate closed");
            return Err(OrchestrationError::QuotaExhausted(provider.clone()));
        }
        if let Some(quota) = limits.daily_request_quota {
            if state.window_count >= quota {
                warn!(provider = %provider, quota, "Daily request quota reached");
                state.exhausted = true;
                return Err(OrchestrationError::QuotaExhausted(provider.clone()));
            }
        }
        if let Some(rpm) = limits.requests_per_minute {
            if state.recent.len() as u32 >= rpm {
                let retry_after = state
                    .recent
                    .front()
                    .map(|oldest| RATE_WINDOW.saturating_sub(now.duration_since(*oldest)))
                    .unwrap_or(RATE_WINDOW);
                debug!(provider = %provider, rpm, retry_after_ms = retry_after.as_millis() as u64, "Rate gate closed");
                return Err(OrchestrationError::RateLimited {
                    provider: provider.clone(),
                    retry_after,
                });
            }
        }

        state.recent.push_back(now);
        state.window_count += 1;
        Ok(())
    }

    /// The provider reported its quota as spent; keep it closed until the window rolls.
    pub fn mark_exhausted(&self, provider: &ProviderId) {
        warn!(provider = %provider, "Provider quota marked exhausted");
        self.state(provider).lock().exhausted = true;
    }

    pub fn is_exhausted(&self, provider: &ProviderId) -> bool {
        let state = self.state(provider);
        let mut state = state.lock();
        state.roll(Instant::now());
        state.exhausted
    }

    pub fn reset(&self, provider: Option<&ProviderId>) {
        match provider {
            Some(id) => {
                self.states.remove(id);
            }
            None => self.states.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(rpm: Option<u32>, daily: Option<u32>) -> ProviderLimits {
        ProviderLimits {
            requests_per_minute: rpm,
            daily_request_quota: daily,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_window_slides() {
        let gates = DispatchGates::new();
        let p = ProviderId::new("community-inference");
        let l = limits(Some(2), None);

        assert!(gates.acquire(&p, &l).is_ok());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(gates.acquire(&p, &l).is_ok());

        match gates.acquire(&p, &l) {
            Err(OrchestrationError::RateLimited { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_secs(30))
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(gates.acquire(&p, &l).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_exhaustion_until_window_resets() {
        let gates = DispatchGates::new();
        let p = ProviderId::new("primary-llm");
        let l = limits(None, Some(1));

        assert!(gates.acquire(&p, &l).is_ok());
        assert!(matches!(
            gates.acquire(&p, &l),
            Err(OrchestrationError::QuotaExhausted(_))
        ));
        assert!(gates.is_exhausted(&p));

        tokio::time::advance(QUOTA_WINDOW).await;
        assert!(gates.acquire(&p, &l).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_marked_exhausted_without_limits() {
        let gates = DispatchGates::new();
        let p = ProviderId::new("primary-llm");
        gates.mark_exhausted(&p);
        assert!(matches!(
            gates.acquire(&p, &ProviderLimits::default()),
            Err(OrchestrationError::QuotaExhausted(_))
        ));

        gates.reset(Some(&p));
        assert!(gates.acquire(&p, &ProviderLimits::default()).is_ok());
    }
}
