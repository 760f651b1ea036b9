use super::{
    ChatMessage, MessageRole, PreparedInput, ProbeResult, ProviderAdapter, ProviderCallError,
    ProviderId,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

/// Where and how to reach one OpenAI-compatible endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EndpointConfig {
    pub base_url: String,
    /// Environment variable holding the bearer token; `None` for unauthenticated local servers
    pub api_key_env: Option<String>,
    pub model: String,
    pub model_max_tokens: u32,
    pub timeout_ms: u64,
    pub display_name: Option<String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            api_key_env: None,
            model: "llama3".to_string(),
            model_max_tokens: 8_192,
            timeout_ms: 120_000,
            display_name: None,
        }
    }
}

impl EndpointConfig {
    /// Endpoints for the four reference providers. Credentials come from the
    /// environment variables named here.
    pub fn reference_endpoints() -> Vec<(ProviderId, EndpointConfig)> {
        vec![
            (
                ProviderId::new("primary-llm"),
                EndpointConfig {
                    base_url: "https://api.openai.com/v1".to_string(),
                    api_key_env: Some("OPENAI_API_KEY".to_string()),
                    model: "gpt-4o-mini".to_string(),
                    model_max_tokens: 128_000,
                    timeout_ms: 60_000,
                    display_name: Some("Commercial API".to_string()),
                },
            ),
            (
                ProviderId::new("enterprise-gateway"),
                EndpointConfig {
                    base_url: "https://gateway.example.internal/v1".to_string(),
                    api_key_env: Some("ENTERPRISE_GATEWAY_API_KEY".to_string()),
                    model: "gpt-4o".to_string(),
                    model_max_tokens: 128_000,
                    timeout_ms: 60_000,
                    display_name: Some("Enterprise gateway".to_string()),
                },
            ),
            (
                ProviderId::new("community-inference"),
                EndpointConfig {
                    base_url: "https://models.inference.ai.azure.com".to_string(),
                    api_key_env: Some("COMMUNITY_INFERENCE_TOKEN".to_string()),
                    model: "gpt-4o-mini".to_string(),
                    model_max_tokens: 8_000,
                    timeout_ms: 60_000,
                    display_name: Some("Community inference".to_string()),
                },
            ),
            (
                ProviderId::new("local-inference"),
                EndpointConfig {
                    display_name: Some("Local inference server".to_string()),
                    ..EndpointConfig::default()
                },
            ),
        ]
    }
}

/// Adapter for any server speaking the `/chat/completions` dialect
/// (hosted APIs, gateways, Ollama, LM Studio).
pub struct OpenAiCompatibleProvider {
    id: ProviderId,
    endpoint: EndpointConfig,
    client: OnceCell<Client>,
}

impl OpenAiCompatibleProvider {
    pub fn new(id: impl Into<ProviderId>, endpoint: EndpointConfig) -> Result<Self> {
        if endpoint.base_url.trim().is_empty() {
            return Err(anyhow!("Provider endpoint cannot be empty"));
        }
        Ok(Self {
            id: id.into(),
            endpoint,
            client: OnceCell::new(),
        })
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint.base_url.trim_end_matches('/'), path)
    }

    fn api_key(&self) -> Option<String> {
        self.endpoint
            .api_key_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|v| !v.trim().is_empty())
    }

    async fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| async {
                Client::builder()
                    .timeout(Duration::from_millis(self.endpoint.timeout_ms))
                    .build()
                    .context("Failed to create HTTP client")
            })
            .await
    }

    fn request(&self, client: &Client, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = client.request(method, self.url(path));
        match self.api_key() {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

fn transport_error(e: reqwest::Error) -> ProviderCallError {
    let kind = if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "network"
    } else {
        "request"
    };
    ProviderCallError::new(kind, e.to_string())
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> From<&'a ChatMessage> for WireMessage<'a> {
    fn from(msg: &'a ChatMessage) -> Self {
        let role = match msg.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };
        Self {
            role,
            content: &msg.content,
        }
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleProvider {
    fn id(&self) -> ProviderId {
        self.id.clone()
    }

    fn display_name(&self) -> String {
        self.endpoint
            .display_name
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }

    fn required_credential_names(&self) -> Vec<String> {
        self.endpoint.api_key_env.iter().cloned().collect()
    }

    fn check_configured(&self) -> bool {
        self.endpoint.api_key_env.is_none() || self.api_key().is_some()
    }

    fn model_max_tokens(&self) -> u32 {
        self.endpoint.model_max_tokens
    }

    async fn connect(&self) -> Result<()> {
        self.client().await.map(|_| ())
    }

    async fn check_reachable(&self) -> Result<ProbeResult> {
        let client = self.client().await?;
        let start = Instant::now();
        let response = self
            .request(client, reqwest::Method::GET, "models")
            .send()
            .await
            .map_err(transport_error)?;
        let elapsed = start.elapsed().as_millis() as u64;

        if response.status().is_success() {
            debug!(provider = %self.id, elapsed_ms = elapsed, "Probe succeeded");
            Ok(ProbeResult::reachable(elapsed))
        } else {
            debug!(provider = %self.id, status = %response.status(), "Probe returned error status");
            Ok(ProbeResult::unreachable(elapsed))
        }
    }

    async fn call(&self, input: &PreparedInput, max_output_tokens: u32) -> Result<String> {
        let client = self.client().await?;
        let body = CompletionRequest {
            model: &self.endpoint.model,
            messages: input.messages.iter().map(WireMessage::from).collect(),
            max_tokens: max_output_tokens,
        };

        info!(
            provider = %self.id,
            model = %self.endpoint.model,
            messages = body.messages.len(),
            "Sending completion request"
        );

        let response = self
            .request(client, reqwest::Method::POST, "chat/completions")
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!(provider = %self.id, status = %status, "Provider API error: {}", text);
            return Err(ProviderCallError::from_status_code(status.as_u16(), text).into());
        }

        let parsed: CompletionResponse = response.json().await.map_err(transport_error)?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                ProviderCallError::new("invalid_response", "response contained no choices").into()
            })
    }
}
