use anyhow::Result;
use clap::Args;
use console::style;
use llm_failover::{ExecuteOptions, LoadedConfig, PreparedInput, ProviderId};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Args)]
pub struct AskCommand {
    /// Prompt to send
    pub prompt: String,

    /// Optional system message
    #[arg(short, long)]
    pub system: Option<String>,

    /// Only use this provider; never fall back
    #[arg(long)]
    pub strict: Option<String>,

    #[arg(long, default_value_t = 1024)]
    pub max_tokens: u32,
}

impl AskCommand {
    pub async fn execute(&self, loaded: &LoadedConfig) -> Result<()> {
        let orchestrator = super::build_orchestrator(loaded)?;
        orchestrator.start();

        let cancel = CancellationToken::new();
        let on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling request");
                on_interrupt.cancel();
            }
        });

        let mut input = PreparedInput::new();
        if let Some(system) = &self.system {
            input = input.with_system(system.clone());
        }
        input = input.with_user(self.prompt.clone());

        let options = ExecuteOptions {
            strict_provider: self.strict.as_deref().map(ProviderId::from),
            cancel: Some(cancel),
        };
        let result = orchestrator
            .complete_with("ask", options, input, self.max_tokens)
            .await;
        orchestrator.shutdown();

        let answer = result?;
        println!("{}", answer);

        let history = orchestrator.fallback_history();
        if !history.is_empty() {
            eprintln!(
                "{} answered by {} after {} fallback event(s)",
                style("ℹ").cyan(),
                orchestrator.active_provider(),
                history.len()
            );
        }
        Ok(())
    }
}
