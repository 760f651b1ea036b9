use super::EnvironmentConfig;
use crate::providers::{EndpointConfig, ProviderId};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Everything a config file can carry: the orchestration settings plus the
/// HTTP endpoints of the providers it names.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoadedConfig {
    pub orchestration: EnvironmentConfig,
    pub endpoints: BTreeMap<ProviderId, EndpointConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    File(PathBuf),
    Default,
}

pub struct ConfigLoader {
    config_paths: Vec<PathBuf>,
    env_prefix: String,
    load_dotenv: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_paths: Self::default_config_paths(),
            env_prefix: "LLM_FAILOVER_".to_string(),
            load_dotenv: true,
        }
    }

    /// Loader that only looks at the given path (plus environment overrides).
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_paths: vec![path.into()],
            ..Self::new()
        }
    }

    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.config_paths.insert(0, path);
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn without_dotenv(mut self) -> Self {
        self.load_dotenv = false;
        self
    }

    fn default_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("llm-failover.toml"),
            PathBuf::from("llm-failover.json"),
        ];

        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".llm-failover.toml"));
            paths.push(home_dir.join(".llm-failover.json"));
        }

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("llm-failover").join("config.toml"));
            paths.push(config_dir.join("llm-failover").join("config.json"));
        }

        paths
    }

    /// Defaults, then the first readable config file, then environment overrides.
    pub async fn load(&self) -> Result<(LoadedConfig, ConfigSource)> {
        if self.load_dotenv {
            if let Ok(path) = dotenv::dotenv() {
                debug!("Loaded environment from {}", path.display());
            }
        }

        let mut config = LoadedConfig::default();
        let mut source = ConfigSource::Default;

        for path in &self.config_paths {
            if !path.exists() {
                continue;
            }
            match Self::load_file(path).await {
                Ok(file_config) => {
                    info!("Loaded configuration from: {}", path.display());
                    config = file_config;
                    source = ConfigSource::File(path.clone());
                    break;
                }
                Err(e) => {
                    warn!("Failed to load config from {}: {:#}", path.display(), e);
                }
            }
        }

        self.apply_env_overrides(&mut config.orchestration)?;
        Ok((config, source))
    }

    async fn load_file(path: &Path) -> Result<LoadedConfig> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        match extension {
            "json" => serde_json::from_str(&content).context("Failed to parse JSON config"),
            "toml" | "" => toml::from_str(&content).context("Failed to parse TOML config"),
            _ => toml::from_str(&content)
                .or_else(|_| serde_json::from_str(&content))
                .context("Failed to parse config file"),
        }
    }

    fn var(&self, name: &str) -> Option<String> {
        env::var(format!("{}{}", self.env_prefix, name))
            .ok()
            .filter(|v| !v.trim().is_empty())
    }

    fn parsed<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        match self.var(name) {
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| anyhow::anyhow!("{}{} = {:?}: {}", self.env_prefix, name, raw, e)),
            None => Ok(None),
        }
    }

    fn apply_env_overrides(&self, config: &mut EnvironmentConfig) -> Result<()> {
        if let Some(primary) = self.var("PRIMARY_PROVIDER") {
            config.primary_provider = ProviderId::new(primary.trim());
        }

        if let Some(list) = self.var("FALLBACK_PROVIDERS") {
            config.fallback_providers = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ProviderId::new)
                .collect();
        }

        if let Some(flag) = self.var("AUTO_FALLBACK") {
            config.auto_fallback_enabled = matches!(
                flag.trim().to_lowercase().as_str(),
                "true" | "1" | "yes" | "on"
            );
        }

        if let Some(v) = self.parsed("HEALTH_CHECK_INTERVAL_MS")? {
            config.health_check_interval_ms = v;
        }
        if let Some(v) = self.parsed("HEALTH_CHECK_TIMEOUT_MS")? {
            config.performance_thresholds.health_check_timeout_ms = v;
        }
        if let Some(v) = self.parsed("UNHEALTHY_PROBE_THRESHOLD")? {
            config.unhealthy_probe_threshold = v;
        }
        if let Some(v) = self.parsed("MAX_RETRIES")? {
            config.retry.max_retries = v;
        }
        if let Some(v) = self.parsed("BASE_DELAY_MS")? {
            config.retry.base_delay_ms = v;
        }
        if let Some(v) = self.parsed("MAX_DELAY_MS")? {
            config.retry.max_delay_ms = v;
        }
        if let Some(v) = self.parsed("FAILURE_THRESHOLD")? {
            config.circuit_breaker.failure_threshold = v;
        }
        if let Some(v) = self.parsed("RESET_TIMEOUT_MS")? {
            config.circuit_breaker.reset_timeout_ms = v;
        }

        Ok(())
    }

    /// Persist the effective configuration; the format follows the extension.
    pub async fn save(config: &LoadedConfig, path: &Path) -> Result<()> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("toml");

        let content = match extension {
            "json" => serde_json::to_string_pretty(config)?,
            _ => toml::to_string_pretty(config)?,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        fs::write(path, content).await?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }
}
