use crate::providers::ProviderId;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the orchestration core.
///
/// The variants map one-to-one onto the operator responses they require:
/// configuration problems are fixed by editing config, strict-mode failures by
/// lifting the restriction, exhaustion by bringing a provider back.
#[derive(Error, Debug, Clone)]
pub enum OrchestrationError {
    // === Configuration ===
    #[error("Configuration invalid: {0}")]
    Configuration(String),

    #[error("Configuration invalid: unsupported provider '{0}'")]
    UnsupportedProvider(ProviderId),

    #[error("Configuration invalid: provider '{provider}' is missing credentials ({})", .missing.join(", "))]
    MissingCredentials {
        provider: ProviderId,
        missing: Vec<String>,
    },

    // === Provider call failures ===
    #[error("Provider '{provider}' failed after {attempts} attempt(s): {message}")]
    ProviderFailed {
        provider: ProviderId,
        attempts: u32,
        message: String,
        retryable: bool,
    },

    // === Gates ===
    #[error("Circuit breaker open for provider '{0}'")]
    CircuitOpen(ProviderId),

    #[error("Rate limit reached for provider '{provider}' (retry in {retry_after:?})")]
    RateLimited {
        provider: ProviderId,
        retry_after: Duration,
    },

    #[error("Quota exhausted for provider '{0}'")]
    QuotaExhausted(ProviderId),

    // === Terminal outcomes ===
    #[error("Strict mode disabled fallback: provider '{provider}' unavailable: {reason}")]
    StrictModeViolation { provider: ProviderId, reason: String },

    #[error("Automatic fallback is disabled: provider '{provider}' failed: {last_error}")]
    FallbackDisabled {
        provider: ProviderId,
        last_error: String,
    },

    #[error("No healthy fallback existed (attempted: {}): {last_error}", format_providers(.attempted))]
    NoHealthyFallback {
        attempted: Vec<ProviderId>,
        last_error: String,
    },

    #[error("Chunking failed: {0}")]
    Chunking(String),

    #[error("Operation cancelled")]
    Cancelled,
}

pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

impl OrchestrationError {
    /// Errors that must reach the caller as-is, never triggering a provider switch.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationError::Configuration(_)
                | OrchestrationError::UnsupportedProvider(_)
                | OrchestrationError::Chunking(_)
                | OrchestrationError::Cancelled
        )
    }

    /// True for failures of a pre-dispatch gate (circuit, rate limit, quota, credentials).
    pub fn is_gate_failure(&self) -> bool {
        matches!(
            self,
            OrchestrationError::CircuitOpen(_)
                | OrchestrationError::RateLimited { .. }
                | OrchestrationError::QuotaExhausted(_)
                | OrchestrationError::MissingCredentials { .. }
        )
    }
}

fn format_providers(providers: &[ProviderId]) -> String {
    if providers.is_empty() {
        return "none".to_string();
    }
    providers
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_distinguish_operator_responses() {
        let strict = OrchestrationError::StrictModeViolation {
            provider: ProviderId::new("local-inference"),
            reason: "circuit open".to_string(),
        };
        let exhausted = OrchestrationError::NoHealthyFallback {
            attempted: vec![ProviderId::new("a"), ProviderId::new("b")],
            last_error: "503".to_string(),
        };
        let config = OrchestrationError::UnsupportedProvider(ProviderId::new("nope"));

        assert!(strict.to_string().contains("Strict mode disabled fallback"));
        assert!(exhausted.to_string().contains("No healthy fallback existed"));
        assert!(exhausted.to_string().contains("a, b"));
        assert!(config.to_string().contains("Configuration invalid"));
    }

    #[test]
    fn test_terminal_and_gate_classification() {
        assert!(OrchestrationError::Chunking("no user message".into()).is_terminal());
        assert!(OrchestrationError::Cancelled.is_terminal());
        assert!(!OrchestrationError::QuotaExhausted(ProviderId::new("x")).is_terminal());
        assert!(OrchestrationError::QuotaExhausted(ProviderId::new("x")).is_gate_failure());
        assert!(OrchestrationError::CircuitOpen(ProviderId::new("x")).is_gate_failure());
    }
}
