//! Retry with exponential backoff for a single operation against a single provider.
//!
//! The executor is stateless across calls: everything it needs comes from the
//! [`RetryConfig`] passed in. Errors are classified as retryable either from a
//! typed [`ProviderCallError`] status or by matching the configured signatures
//! against the error text.
//!
//! ## Usage
//! ```no_run
//! use llm_failover::retry::execute_with_retry;
//! use llm_failover::{ProviderId, RetryConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() {
//! let config = RetryConfig::default();
//! let provider = ProviderId::new("primary-llm");
//! let cancel = CancellationToken::new();
//! let result = execute_with_retry(&config, "summarize", &provider, &cancel, |_attempt| async {
//!     Ok::<_, anyhow::Error>("success")
//! })
//! .await;
//! # }
//! ```

use crate::errors::OrchestrationError;
use crate::providers::{ProviderCallError, ProviderId};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use crate::config::RetryConfig;

/// How a retried operation ultimately failed.
#[derive(Debug, Error)]
pub enum RetryFailure {
    #[error("operation cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },

    #[error("{last_error} (after {attempts} attempt(s))")]
    Exhausted {
        attempts: u32,
        retryable: bool,
        last_error: anyhow::Error,
    },
}

impl RetryFailure {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryFailure::Cancelled { attempts } | RetryFailure::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Decide whether `error` is transient under the given signature list.
///
/// Orchestration errors (gates, configuration) are never retried against the
/// same provider.
pub fn is_retryable(error: &anyhow::Error, signatures: &[String]) -> bool {
    if error.downcast_ref::<OrchestrationError>().is_some() {
        return false;
    }

    if let Some(call_error) = error.downcast_ref::<ProviderCallError>() {
        if call_error.is_transient() {
            return true;
        }
        if call_error.status.is_some() {
            return false;
        }
    }

    let message = format!("{:#}", error).to_lowercase();
    signatures
        .iter()
        .any(|signature| message.contains(&signature.to_lowercase()))
}

/// Delay before retry `n` (first retry is `n = 1`), without jitter.
pub fn backoff_delay(config: &RetryConfig, n: u32) -> Duration {
    let exponent = n.saturating_sub(1) as i32;
    let delay_ms = config.base_delay_ms as f64 * config.backoff_multiplier.powi(exponent);
    let capped = delay_ms.min(config.max_delay_ms as f64).max(0.0);
    Duration::from_millis(capped as u64)
}

/// Adds uniform jitter in `[0, delay * 0.1]`.
pub fn with_jitter(delay: Duration) -> Duration {
    let max_jitter = delay.as_millis() as u64 / 10;
    if max_jitter == 0 {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(0..=max_jitter);
    delay + Duration::from_millis(jitter)
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `config.max_retries` retries are spent. The operation receives the
/// zero-based attempt number.
///
/// Cancellation is checked before every attempt and interrupts the backoff sleep.
pub async fn execute_with_retry<T, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    provider: &ProviderId,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, RetryFailure>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            debug!(provider = %provider, operation = operation_name, "Cancelled before attempt {}", attempt + 1);
            return Err(RetryFailure::Cancelled { attempts: attempt });
        }

        match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    info!(
                        provider = %provider,
                        operation = operation_name,
                        "✅ {} succeeded after {} retries",
                        operation_name,
                        attempt
                    );
                }
                return Ok(value);
            }
            Err(e) => {
                let attempts = attempt + 1;
                let retryable = is_retryable(&e, &config.retryable_error_signatures);

                if !retryable {
                    debug!(
                        provider = %provider,
                        operation = operation_name,
                        "Non-retryable error: {:#}",
                        e
                    );
                    return Err(RetryFailure::Exhausted {
                        attempts,
                        retryable: false,
                        last_error: e,
                    });
                }

                if attempt >= config.max_retries {
                    error!(
                        provider = %provider,
                        operation = operation_name,
                        attempts,
                        "❌ {} failed after {} attempts: {:#}",
                        operation_name,
                        attempts,
                        e
                    );
                    return Err(RetryFailure::Exhausted {
                        attempts,
                        retryable: true,
                        last_error: e,
                    });
                }

                attempt += 1;
                let delay = with_jitter(backoff_delay(config, attempt));
                warn!(
                    provider = %provider,
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "🔄 Retrying {} after error: {:#}",
                    operation_name,
                    e
                );

                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(RetryFailure::Cancelled { attempts });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
