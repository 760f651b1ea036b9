use crate::config::CircuitBreakerConfig;
use crate::providers::ProviderId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,   // Normal operation
    Open,     // Failing, rejecting requests
    HalfOpen, // Testing if service recovered
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

/// Called with every state transition, while the breaker is still borrowed.
pub type StateObserver = Arc<dyn Fn(&ProviderId, CircuitState) + Send + Sync>;

/// Per-provider circuit breaker.
///
/// Not synchronized: callers keep each instance behind a per-provider mutex.
pub struct CircuitBreaker {
    provider: ProviderId,
    state: CircuitState,
    failure_count: u32,
    failure_threshold: u32,
    reset_timeout: Duration,
    opened_at: Option<Instant>,
    half_open_calls: u32,
    half_open_max_calls: u32,
    observer: Option<StateObserver>,
}

impl CircuitBreaker {
    pub fn new(
        provider: ProviderId,
        config: &CircuitBreakerConfig,
        observer: Option<StateObserver>,
    ) -> Self {
        Self {
            provider,
            state: CircuitState::Closed,
            failure_count: 0,
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: config.reset_timeout(),
            opened_at: None,
            half_open_calls: 0,
            half_open_max_calls: config.half_open_max_calls.max(1),
            observer,
        }
    }

    fn transition(&mut self, next: CircuitState) {
        if self.state == next {
            return;
        }
        self.state = next;
        if let Some(observer) = &self.observer {
            observer(&self.provider, next);
        }
    }

    fn open(&mut self) {
        self.opened_at = Some(Instant::now());
        self.half_open_calls = 0;
        self.transition(CircuitState::Open);
    }

    /// May a call proceed. In OPEN this performs the timed move to HALF_OPEN,
    /// and that first admitted call is the first half-open probe.
    pub fn allow(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.reset_timeout);
                if elapsed >= self.reset_timeout {
                    info!(provider = %self.provider, "🔄 Circuit breaker moving to HALF_OPEN state");
                    self.half_open_calls = 1;
                    self.transition(CircuitState::HalfOpen);
                    true
                } else {
                    debug!(provider = %self.provider, "⭕ Circuit breaker OPEN - blocking request");
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_calls < self.half_open_max_calls {
                    self.half_open_calls += 1;
                    debug!(
                        provider = %self.provider,
                        "🧪 Circuit breaker HALF_OPEN - test request {}/{}",
                        self.half_open_calls, self.half_open_max_calls
                    );
                    true
                } else {
                    debug!(provider = %self.provider, "⭕ Circuit breaker HALF_OPEN - max tests reached");
                    false
                }
            }
        }
    }

    pub fn on_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                if self.failure_count > 0 {
                    debug!(
                        provider = %self.provider,
                        "✅ Circuit breaker - resetting failure count from {}",
                        self.failure_count
                    );
                    self.failure_count = 0;
                }
            }
            CircuitState::HalfOpen => {
                info!(provider = %self.provider, "✅ Circuit breaker - recovery successful, moving to CLOSED");
                self.failure_count = 0;
                self.opened_at = None;
                self.half_open_calls = 0;
                self.transition(CircuitState::Closed);
            }
            CircuitState::Open => {
                // a call admitted before the breaker opened finished late
                debug!(provider = %self.provider, "Circuit breaker - late success ignored in OPEN state");
            }
        }
    }

    pub fn on_failure(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    warn!(
                        provider = %self.provider,
                        "🚨 Circuit breaker OPENING - {} consecutive failures",
                        self.failure_count
                    );
                    self.open();
                } else {
                    debug!(
                        provider = %self.provider,
                        "❌ Circuit breaker - failure {}/{}",
                        self.failure_count, self.failure_threshold
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.failure_count += 1;
                warn!(provider = %self.provider, "🚨 Circuit breaker - test failed, back to OPEN state");
                self.open();
            }
            CircuitState::Open => {
                debug!(provider = %self.provider, "❌ Circuit breaker - additional failure in OPEN state");
            }
        }
    }

    /// Give back a half-open slot taken by `allow` for a call that ended
    /// without an outcome (gated, cancelled or aborted).
    pub fn release(&mut self) {
        if self.state == CircuitState::HalfOpen && self.half_open_calls > 0 {
            self.half_open_calls -= 1;
            debug!(
                provider = %self.provider,
                "Circuit breaker HALF_OPEN - test slot released ({}/{})",
                self.half_open_calls, self.half_open_max_calls
            );
        }
    }

    pub fn current_state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Time left before an OPEN breaker admits a probe.
    pub fn remaining_open_time(&self) -> Option<Duration> {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(at)) => Some(self.reset_timeout.saturating_sub(at.elapsed())),
            _ => None,
        }
    }

    pub fn state_info(&self) -> String {
        match self.state {
            CircuitState::Closed => format!("CLOSED (failures: {})", self.failure_count),
            CircuitState::Open => match self.remaining_open_time() {
                Some(remaining) => format!("OPEN (recovery in: {:?})", remaining),
                None => "OPEN".to_string(),
            },
            CircuitState::HalfOpen => format!(
                "HALF_OPEN (tests: {}/{})",
                self.half_open_calls, self.half_open_max_calls
            ),
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("provider", &self.provider)
            .field("state", &self.state)
            .field("failure_count", &self.failure_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn config(threshold: u32, reset_ms: u64, half_open: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout_ms: reset_ms,
            half_open_max_calls: half_open,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_flow() {
        let mut cb = CircuitBreaker::new(ProviderId::new("p"), &config(3, 100, 3), None);

        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert!(cb.allow());

        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.current_state(), CircuitState::Closed);

        cb.on_failure();
        assert_eq!(cb.current_state(), CircuitState::Open);
        assert!(!cb.allow());

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(cb.allow());
        assert_eq!(cb.current_state(), CircuitState::HalfOpen);

        cb.on_success();
        assert_eq!(cb.current_state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_until_reset_timeout_elapsed() {
        let mut cb = CircuitBreaker::new(ProviderId::new("p"), &config(2, 1_000, 1), None);
        cb.on_failure();
        cb.on_failure();

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!cb.allow());
        assert_eq!(cb.current_state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cb.allow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_max_calls() {
        let mut cb = CircuitBreaker::new(ProviderId::new("p"), &config(1, 10, 3), None);
        cb.on_failure();
        tokio::time::advance(Duration::from_millis(10)).await;

        let admitted = (0..10).filter(|_| cb.allow()).count();
        assert_eq!(admitted, 3);

        cb.on_failure();
        assert_eq!(cb.current_state(), CircuitState::Open);
        assert!(!cb.allow());

        // the counter is reset at the next OPEN -> HALF_OPEN transition
        tokio::time::advance(Duration::from_millis(10)).await;
        let admitted = (0..10).filter(|_| cb.allow()).count();
        assert_eq!(admitted, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_slot_can_be_reused() {
        let mut cb = CircuitBreaker::new(ProviderId::new("p"), &config(1, 10, 1), None);
        cb.on_failure();
        tokio::time::advance(Duration::from_millis(10)).await;

        assert!(cb.allow());
        assert!(!cb.allow());
        assert_eq!(cb.state_info(), "HALF_OPEN (tests: 1/1)");

        cb.release();
        assert_eq!(cb.state_info(), "HALF_OPEN (tests: 0/1)");
        assert!(cb.allow());
        cb.on_success();
        assert_eq!(cb.current_state(), CircuitState::Closed);

        // no-op outside HALF_OPEN
        cb.release();
        assert_eq!(cb.state_info(), "CLOSED (failures: 0)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_every_transition() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer: StateObserver = Arc::new(move |_, state| sink.lock().push(state));

        let mut cb = CircuitBreaker::new(ProviderId::new("p"), &config(1, 10, 1), Some(observer));
        cb.on_failure();
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(cb.allow());
        cb.on_success();

        assert_eq!(
            *seen.lock(),
            vec![CircuitState::Open, CircuitState::HalfOpen, CircuitState::Closed]
        );
    }

    #[test]
    fn test_success_resets_closed_failure_count() {
        let mut cb = CircuitBreaker::new(ProviderId::new("p"), &config(3, 10, 1), None);
        cb.on_failure();
        cb.on_failure();
        cb.on_success();
        cb.on_failure();
        cb.on_failure();
        assert_eq!(cb.current_state(), CircuitState::Closed);
    }
}
