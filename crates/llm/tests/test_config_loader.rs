use llm_failover::{ConfigLoader, ConfigSource, EndpointConfig, LoadedConfig, ProviderId};
use serial_test::serial;
use std::env;

const PREFIX: &str = "LLM_FAILOVER_IT_";

fn clear_env() {
    for name in [
        "PRIMARY_PROVIDER",
        "FALLBACK_PROVIDERS",
        "AUTO_FALLBACK",
        "MAX_RETRIES",
        "FAILURE_THRESHOLD",
    ] {
        env::remove_var(format!("{PREFIX}{name}"));
    }
}

fn loader(path: impl Into<std::path::PathBuf>) -> ConfigLoader {
    ConfigLoader::for_path(path)
        .with_env_prefix(PREFIX)
        .without_dotenv()
}

#[tokio::test]
#[serial]
async fn test_toml_file_is_merged_over_defaults() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("llm-failover.toml");
    std::fs::write(
        &path,
        r#"
[orchestration]
primary_provider = "local-inference"
fallback_providers = ["primary-llm"]

[orchestration.retry]
max_retries = 1

[endpoints.local-inference]
base_url = "http://127.0.0.1:1234/v1"
model = "qwen2"
"#,
    )
    .unwrap();

    let (loaded, source) = loader(&path).load().await.unwrap();

    assert_eq!(source, ConfigSource::File(path));
    let config = &loaded.orchestration;
    assert_eq!(config.primary_provider, ProviderId::new("local-inference"));
    assert_eq!(config.fallback_providers, vec![ProviderId::new("primary-llm")]);
    assert_eq!(config.retry.max_retries, 1);
    // untouched sections keep their defaults
    assert_eq!(config.retry.base_delay_ms, 1_000);
    assert_eq!(config.circuit_breaker.failure_threshold, 5);

    let endpoint = &loaded.endpoints[&ProviderId::new("local-inference")];
    assert_eq!(endpoint.model, "qwen2");
    assert_eq!(endpoint.model_max_tokens, EndpointConfig::default().model_max_tokens);
}

#[tokio::test]
#[serial]
async fn test_environment_overrides_file_values() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("llm-failover.toml");
    std::fs::write(&path, "[orchestration]\nprimary_provider = \"primary-llm\"\n").unwrap();

    env::set_var(format!("{PREFIX}PRIMARY_PROVIDER"), "enterprise-gateway");
    env::set_var(format!("{PREFIX}FALLBACK_PROVIDERS"), "local-inference, primary-llm");
    env::set_var(format!("{PREFIX}AUTO_FALLBACK"), "off");
    env::set_var(format!("{PREFIX}FAILURE_THRESHOLD"), "2");

    let result = loader(&path).load().await;
    clear_env();
    let (loaded, _) = result.unwrap();

    let config = loaded.orchestration;
    assert_eq!(config.primary_provider, ProviderId::new("enterprise-gateway"));
    assert_eq!(
        config.fallback_providers,
        vec![ProviderId::new("local-inference"), ProviderId::new("primary-llm")]
    );
    assert!(!config.auto_fallback_enabled);
    assert_eq!(config.circuit_breaker.failure_threshold, 2);
}

#[tokio::test]
#[serial]
async fn test_malformed_numeric_override_is_an_error() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    env::set_var(format!("{PREFIX}MAX_RETRIES"), "many");

    let result = loader(dir.path().join("absent.toml")).load().await;
    clear_env();

    let err = result.unwrap_err();
    assert!(err.to_string().contains("MAX_RETRIES"));
}

#[tokio::test]
#[serial]
async fn test_saved_configuration_loads_back() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();

    let mut original = LoadedConfig::default();
    original.orchestration.auto_fallback_enabled = false;
    original.orchestration.unhealthy_probe_threshold = 3;
    original
        .endpoints
        .insert(ProviderId::new("local-inference"), EndpointConfig::default());

    for file in ["saved.toml", "nested/saved.json"] {
        let path = dir.path().join(file);
        ConfigLoader::save(&original, &path).await.unwrap();
        let (loaded, source) = loader(&path).load().await.unwrap();
        assert_eq!(source, ConfigSource::File(path));
        assert_eq!(loaded, original);
    }
}
