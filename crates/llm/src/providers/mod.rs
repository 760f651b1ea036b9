use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub mod catalog;
pub mod openai_compatible;

pub use catalog::{ProviderCatalog, ProviderDescriptor};
pub use openai_compatible::{EndpointConfig, OpenAiCompatibleProvider};

/// Opaque provider identity, e.g. `primary-llm` or `local-inference`.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProviderId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Chat message for conversation context
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Input handed to an adapter's `call`, already rendered by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PreparedInput {
    pub messages: Vec<ChatMessage>,
}

impl PreparedInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system(mut self, content: impl Into<String>) -> Self {
        self.messages.push(ChatMessage::system(content));
        self
    }

    pub fn with_user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(ChatMessage::user(content));
        self
    }

    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    /// Index of the last user-role message, the one that carries the payload.
    pub fn last_user_index(&self) -> Option<usize> {
        self.messages
            .iter()
            .rposition(|m| m.role == MessageRole::User)
    }
}

/// Result of a connectivity probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub reachable: bool,
    pub response_time_ms: u64,
}

impl ProbeResult {
    pub fn reachable(response_time_ms: u64) -> Self {
        Self {
            reachable: true,
            response_time_ms,
        }
    }

    pub fn unreachable(response_time_ms: u64) -> Self {
        Self {
            reachable: false,
            response_time_ms,
        }
    }
}

/// Typed failure an adapter can return (wrapped in `anyhow::Error`) so the retry
/// classifier can decide on the status code instead of the message text.
#[derive(Error, Debug, Clone)]
#[error("{kind} (status: {status:?}): {message}")]
pub struct ProviderCallError {
    pub kind: String,
    pub status: Option<u16>,
    pub message: String,
}

impl ProviderCallError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            status: None,
            message: message.into(),
        }
    }

    /// Build from an HTTP status code, naming the error class.
    pub fn from_status_code(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            429 => "rate_limit",
            408 => "timeout",
            500..=599 => "server_error",
            400 => "bad_request",
            401 => "unauthorized",
            403 => "forbidden",
            404 => "not_found",
            _ => "unknown",
        };
        Self {
            kind: kind.to_string(),
            status: Some(status),
            message: message.into(),
        }
    }

    /// Transport timeouts, connection failures and 408/429/5xx are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self.status {
            Some(status) => matches!(status, 408 | 429 | 500..=599),
            None => matches!(self.kind.as_str(), "timeout" | "network" | "rate_limit"),
        }
    }
}

/// Contract every backend implements once. The core never branches on a
/// provider's identity; it only talks to this trait through the catalog.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Registry key for this backend.
    fn id(&self) -> ProviderId;

    /// Human-readable name for diagnostics.
    fn display_name(&self) -> String {
        self.id().to_string()
    }

    /// Names of the credentials (usually environment variables) this backend needs.
    fn required_credential_names(&self) -> Vec<String>;

    /// Whether every required credential is present.
    fn check_configured(&self) -> bool;

    /// Maximum context window of the configured model, in tokens.
    fn model_max_tokens(&self) -> u32;

    /// Prepare client/session state. Called once before the first dispatch.
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Lightweight connectivity check.
    async fn check_reachable(&self) -> Result<ProbeResult>;

    /// Execute one model call.
    async fn call(&self, input: &PreparedInput, max_output_tokens: u32) -> Result<String>;
}

/// A provider that passed its pre-dispatch checks and has a live client.
#[derive(Clone)]
pub struct ProviderSession {
    id: ProviderId,
    adapter: Arc<dyn ProviderAdapter>,
}

impl ProviderSession {
    pub(crate) fn new(id: ProviderId, adapter: Arc<dyn ProviderAdapter>) -> Self {
        Self { id, adapter }
    }

    pub fn id(&self) -> &ProviderId {
        &self.id
    }

    pub fn adapter(&self) -> &Arc<dyn ProviderAdapter> {
        &self.adapter
    }
}

impl fmt::Debug for ProviderSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderSession")
            .field("id", &self.id)
            .field("adapter", &self.adapter.display_name())
            .finish()
    }
}
