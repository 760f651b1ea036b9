use anyhow::Result;
use clap::{Args, Subcommand};
use console::style;
use llm_failover::{ConfigLoader, LoadedConfig};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigSubcommand {
    /// Validate the effective configuration against the registered providers
    #[command(alias = "check")]
    Validate {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print a commented configuration template
    #[command(alias = "gen")]
    Template,

    /// Write the effective configuration to a file
    Init {
        #[arg(short, long, default_value = "llm-failover.toml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

impl ConfigCommand {
    pub async fn execute(&self, loaded: &LoadedConfig) -> Result<()> {
        match &self.command {
            ConfigSubcommand::Validate { json } => validate(loaded, *json),
            ConfigSubcommand::Template => {
                let orchestrator = super::build_orchestrator(loaded)?;
                println!("{}", orchestrator.generate_configuration_template());
                Ok(())
            }
            ConfigSubcommand::Init { output, force } => init(loaded, output, *force).await,
        }
    }
}

fn validate(loaded: &LoadedConfig, json: bool) -> Result<()> {
    let orchestrator = match super::build_orchestrator(loaded) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            println!("{} {:#}", style("❌ Configuration invalid:").red().bold(), e);
            return Err(e);
        }
    };
    let report = orchestrator.validate_configuration();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        if report.valid {
            println!("{}", style("✅ Configuration is valid").green().bold());
        } else {
            println!("{}", style("❌ Configuration has errors").red().bold());
        }
        for error in &report.errors {
            println!("  {} {}", style("error:").red(), error);
        }
        for warning in &report.warnings {
            println!("  {} {}", style("warning:").yellow(), warning);
        }
        for recommendation in &report.recommendations {
            println!("  {} {}", style("hint:").cyan(), recommendation);
        }
    }

    if report.valid {
        Ok(())
    } else {
        anyhow::bail!("{} configuration error(s)", report.errors.len())
    }
}

async fn init(loaded: &LoadedConfig, output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        warn!("Configuration file already exists at: {}", output.display());
        println!("Use --force to overwrite or choose a different path");
        return Ok(());
    }

    ConfigLoader::save(loaded, output).await?;
    info!("Configuration file written to: {}", output.display());
    println!("✅ Configuration written to {}", style(output.display()).bold());
    Ok(())
}
