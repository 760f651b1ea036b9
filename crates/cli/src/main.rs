use anyhow::Result;
use clap::{Parser, Subcommand};
use common::{init_structured_logging, LoggingConfig};
use console::style;
use llm_failover::{ConfigLoader, ConfigSource};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, Level};

mod commands;

use commands::{AskCommand, ConfigCommand, HealthCommand};

#[derive(Parser)]
#[command(name = "llm-failover")]
#[command(about = "Multi-provider LLM calls with health tracking and automatic failover")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML or JSON); defaults to the standard search paths
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit JSON log lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate, template or initialize configuration
    Config(ConfigCommand),
    /// Probe every configured provider once
    Health(HealthCommand),
    /// Send one prompt through the failover pipeline
    Ask(AskCommand),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let logging = LoggingConfig {
        level: if cli.verbose { Level::DEBUG } else { Level::WARN },
        json_output: cli.json_logs,
        ..LoggingConfig::default()
    };
    if let Err(e) = init_structured_logging(logging) {
        eprintln!("failed to initialize logging: {e:#}");
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let loader = match &cli.config {
        Some(path) => ConfigLoader::for_path(path),
        None => ConfigLoader::new(),
    };
    let (loaded, source) = loader.load().await?;
    match &source {
        ConfigSource::File(path) => debug!("Loaded configuration from {}", path.display()),
        ConfigSource::Default => debug!("No configuration file found, using defaults"),
    }

    match cli.command {
        Commands::Config(cmd) => cmd.execute(&loaded).await,
        Commands::Health(cmd) => cmd.execute(&loaded).await,
        Commands::Ask(cmd) => cmd.execute(&loaded).await,
    }
}
