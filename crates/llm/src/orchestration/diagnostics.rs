use super::health_monitor::{HealthStatus, ProviderHealthTracker};
use crate::config::EnvironmentConfig;
use crate::providers::ProviderCatalog;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Check a config against the registered providers and their current health.
pub fn validate_configuration(
    config: &EnvironmentConfig,
    catalog: &ProviderCatalog,
    health: &ProviderHealthTracker,
) -> ConfigValidationReport {
    let mut report = ConfigValidationReport {
        errors: config.structural_errors(),
        ..ConfigValidationReport::default()
    };

    for (position, provider) in config.ordered_providers().iter().enumerate() {
        let is_primary = position == 0;
        if !catalog.contains(provider) {
            report
                .errors
                .push(format!("unsupported provider '{provider}' (no adapter registered)"));
            continue;
        }

        if let Err(e) = catalog.check_configured(provider) {
            if is_primary {
                report.errors.push(e.to_string());
            } else {
                report.warnings.push(e.to_string());
            }
            if let Ok(adapter) = catalog.get(provider) {
                report.recommendations.push(format!(
                    "Set {} to enable provider '{provider}'",
                    adapter.required_credential_names().join(", ")
                ));
            }
        }

        if health.status(provider) == HealthStatus::Unhealthy {
            report
                .warnings
                .push(format!("provider '{provider}' is currently unhealthy"));
        }
    }

    if config.fallback_providers.is_empty() {
        report
            .warnings
            .push("no fallback providers configured".to_string());
        report
            .recommendations
            .push("Configure at least one fallback provider".to_string());
    }
    if !config.auto_fallback_enabled {
        report
            .warnings
            .push("automatic fallback is disabled; failures surface directly".to_string());
    }
    if config.retry.max_retries == 0 {
        report
            .warnings
            .push("retries are disabled (max_retries = 0)".to_string());
    }
    if config.health_check_interval_ms <= config.performance_thresholds.health_check_timeout_ms {
        report.warnings.push(
            "health_check_interval_ms does not exceed health_check_timeout_ms; probe rounds may overlap"
                .to_string(),
        );
    }
    if config.unhealthy_probe_threshold == 1 {
        report.recommendations.push(
            "Consider unhealthy_probe_threshold >= 2 to avoid promotions on a single slow probe"
                .to_string(),
        );
    }

    let configured = config.ordered_providers();
    for id in catalog.ids() {
        if !configured.contains(id) {
            report.recommendations.push(format!(
                "Provider '{id}' is registered but unused; consider adding it as a fallback"
            ));
        }
    }

    report.valid = report.errors.is_empty();
    report
}

#[derive(Serialize)]
struct TemplateDocument<'a> {
    orchestration: &'a EnvironmentConfig,
}

/// Human-readable summary of the provider setup followed by the effective
/// configuration in TOML.
pub fn generate_configuration_template(
    config: &EnvironmentConfig,
    catalog: &ProviderCatalog,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# LLM provider failover configuration");
    let _ = writeln!(out, "#");
    let _ = writeln!(out, "# Providers in failover order:");

    for (i, provider) in config.ordered_providers().iter().enumerate() {
        let role = if i == 0 { "primary" } else { "fallback" };
        match catalog.get(provider) {
            Ok(adapter) => {
                let credentials = adapter.required_credential_names();
                let status = if adapter.check_configured() { "set" } else { "missing" };
                let credentials = if credentials.is_empty() {
                    "none required".to_string()
                } else {
                    format!("{} [{status}]", credentials.join(", "))
                };
                let _ = writeln!(
                    out,
                    "#   {}. {provider} ({role}, {}) credentials: {credentials}, context window: {} tokens",
                    i + 1,
                    adapter.display_name(),
                    adapter.model_max_tokens()
                );
            }
            Err(_) => {
                let _ = writeln!(out, "#   {}. {provider} ({role}) NOT REGISTERED", i + 1);
            }
        }
    }

    let _ = writeln!(out, "#");
    let _ = writeln!(
        out,
        "# Environment overrides: LLM_FAILOVER_PRIMARY_PROVIDER, LLM_FAILOVER_FALLBACK_PROVIDERS,"
    );
    let _ = writeln!(
        out,
        "#   LLM_FAILOVER_AUTO_FALLBACK, LLM_FAILOVER_MAX_RETRIES, LLM_FAILOVER_FAILURE_THRESHOLD, ..."
    );
    let _ = writeln!(out);

    match toml::to_string_pretty(&TemplateDocument {
        orchestration: config,
    }) {
        Ok(body) => out.push_str(&body),
        Err(e) => {
            let _ = writeln!(out, "# could not render configuration: {e}");
        }
    }
    out
}
