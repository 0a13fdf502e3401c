//! Anthropic-style provider adapter.
//!
//! The wire format differs from the OpenAI family in three ways the
//! adapter must bridge: the system prompt is a top-level field rather
//! than a message, auth uses `x-api-key` plus a pinned
//! `anthropic-version`, and the response carries a list of typed content
//! blocks. There is no model-listing endpoint; discovery uses a
//! hard-coded list.

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{truncate_body, ProviderError};
use crate::{
    CompletionRequest, CompletionResponse, LlmProvider, Message, MessageRole, ModelEntry,
    COMPLETION_TIMEOUT_SECS,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Models served when the backend is configured. Kept current by hand;
/// the backend exposes no listing endpoint.
const KNOWN_MODELS: &[(&str, u32)] = &[
    ("claude-3-5-haiku-latest", 200_000),
    ("claude-3-5-sonnet-latest", 200_000),
    ("claude-3-7-sonnet-latest", 200_000),
    ("claude-opus-4-0", 200_000),
];

/// Adapter for Anthropic-style backends.
#[derive(Clone)]
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: String,
    default_model: String,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(COMPLETION_TIMEOUT_SECS))
            .build()
            .map_err(|e| ProviderError::Client(e.to_string()))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            default_model: default_model.into(),
            client,
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let model = if request.model.is_empty() {
            self.default_model.clone()
        } else {
            request.model.clone()
        };
        let body = build_request_body(&model, &request);

        debug!(provider = %self.name, %model, "sending messages request");
        let started = Instant::now();

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Wire {
                provider: self.name.clone(),
                model: model.clone(),
                detail: e.to_string(),
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ProviderError::RateLimited {
                provider: self.name.clone(),
                model,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Wire {
                provider: self.name.clone(),
                model,
                detail: format!("HTTP {status}: {}", truncate_body(&body)),
            });
        }

        let parsed: MessagesResponse = response.json().await.map_err(|e| ProviderError::Wire {
            provider: self.name.clone(),
            model: model.clone(),
            detail: format!("decode error: {e}"),
        })?;
        let latency_ms = started.elapsed().as_millis() as u64;

        Ok(parse_response(&self.name, &model, parsed, latency_ms))
    }

    async fn list_models(&self) -> Result<Vec<ModelEntry>, ProviderError> {
        Ok(KNOWN_MODELS
            .iter()
            .map(|(name, context_window)| ModelEntry {
                name: (*name).to_string(),
                display_name: None,
                context_window: Some(*context_window),
            })
            .collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request and Response Wire Format
// ─────────────────────────────────────────────────────────────────────────────

fn build_request_body(model: &str, request: &CompletionRequest) -> serde_json::Value {
    // The first system message moves to the top-level field; the rest of
    // the conversation keeps only user/assistant turns.
    let system = request
        .messages
        .iter()
        .find(|m| m.role == MessageRole::System)
        .map(|m| m.content.clone());

    let mut body = json!({
        "model": model,
        "max_tokens": request.max_tokens.unwrap_or(4096),
        "messages": convert_messages(&request.messages),
    });

    if let Some(system) = system {
        body["system"] = json!(system);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = json!(top_p);
    }

    body
}

fn convert_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .map(|msg| {
            json!({
                "role": match msg.role {
                    MessageRole::User | MessageRole::System => "user",
                    MessageRole::Assistant => "assistant",
                },
                "content": msg.content,
            })
        })
        .collect()
}

fn parse_response(
    provider: &str,
    model: &str,
    parsed: MessagesResponse,
    latency_ms: u64,
) -> CompletionResponse {
    // Concatenate text-typed blocks; other block kinds are skipped.
    let content: String = parsed
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text.as_deref())
        .collect();

    let usage = parsed.usage.unwrap_or_default();
    CompletionResponse {
        provider: provider.to_string(),
        model: parsed.model.unwrap_or_else(|| model.to_string()),
        content,
        tokens_in: usage.input_tokens,
        tokens_out: usage.output_tokens,
        finish_reason: parsed.stop_reason,
        latency_ms,
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Option<MessagesUsage>,
    model: Option<String>,
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}
