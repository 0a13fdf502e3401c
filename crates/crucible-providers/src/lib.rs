//! crucible-providers: one completion contract over several remote
//! chat-completion backends.
//!
//! The dispatcher hides wire-format differences behind [`LlmProvider`]
//! and routes requests through a [`ProviderRegistry`]:
//! - A model written `<provider>/<name>` targets that provider directly.
//! - Anything else walks the configured fallback chain in order.
//!
//! One adapter exists per wire family:
//! - [`OpenAiCompatProvider`] — `POST {base}/chat/completions`, bearer auth
//!   (covers several concrete backends).
//! - [`AnthropicProvider`] — `POST {base}/messages`, `x-api-key` +
//!   `anthropic-version` headers.
//! - [`GeminiProvider`] — `POST {base}/models/{model}:generateContent`.

mod anthropic;
mod error;
mod gemini;
mod openai;
mod registry;

pub use anthropic::AnthropicProvider;
pub use error::{truncate_at, truncate_body, ProviderError};
pub use gemini::GeminiProvider;
pub use openai::OpenAiCompatProvider;
pub use registry::{split_model, ProviderRegistry};

use serde::{Deserialize, Serialize};

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }
}

/// Provider-agnostic completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model identifier, possibly `<provider>/<name>`.
    pub model: String,
    pub messages: Vec<Message>,
    /// Sampling temperature in [0, 2].
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub seed: Option<u64>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            top_p: None,
            seed: None,
        }
    }
}

/// Provider-agnostic completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Name of the provider that actually served the request.
    pub provider: String,
    /// Model actually used, as reported by the backend.
    pub model: String,
    pub content: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub finish_reason: Option<String>,
    pub latency_ms: u64,
}

/// One entry of a backend's model listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub display_name: Option<String>,
    pub context_window: Option<u32>,
}

/// A chat-completion backend.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Registry name of this provider.
    fn name(&self) -> &str;

    /// Execute one completion request.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError>;

    /// List the models this backend currently serves.
    async fn list_models(&self) -> Result<Vec<ModelEntry>, ProviderError>;
}

/// Default timeout for a single completion call.
pub(crate) const COMPLETION_TIMEOUT_SECS: u64 = 120;
/// Timeout for model-listing calls made by discovery.
pub(crate) const DISCOVERY_TIMEOUT_SECS: u64 = 15;
