use anyhow::Result;
use clap::Args;
use console::style;
use llm_failover::{HealthStatus, LoadedConfig};

#[derive(Debug, Args)]
pub struct HealthCommand {
    /// Print per-provider health as JSON
    #[arg(long)]
    pub json: bool,
}

impl HealthCommand {
    /// Probe every configured provider once and report the result.
    pub async fn execute(&self, loaded: &LoadedConfig) -> Result<()> {
        let orchestrator = super::build_orchestrator(loaded)?;
        let statuses = orchestrator.run_health_check().await;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&orchestrator.all_provider_health())?
            );
            return Ok(());
        }

        println!("{}", style("🏥 Provider health").bold());
        for (id, status) in &statuses {
            let label = match status {
                HealthStatus::Healthy => style("healthy").green(),
                HealthStatus::Degraded => style("degraded").yellow(),
                HealthStatus::Unhealthy => style("unhealthy").red(),
            };
            let health = orchestrator.provider_health(id);
            println!(
                "  {:<24} {:<10} {}ms",
                id.as_str(),
                label,
                health.response_time_ms
            );
        }

        if let Some(best) = orchestrator.recommended_provider() {
            println!("Recommended provider: {}", style(best).cyan().bold());
        }
        for event in orchestrator.fallback_history() {
            println!(
                "  {} {} -> {} ({})",
                if event.success { "🔀" } else { "⚠️" },
                event.from_provider,
                event.to_provider,
                event.reason
            );
        }
        Ok(())
    }
}
