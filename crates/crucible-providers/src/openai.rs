//! OpenAI-compatible provider adapter.
//!
//! Several concrete backends speak this wire format; the adapter is
//! instantiated once per configured backend with its own name, base URL,
//! and key.

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{truncate_body, ProviderError};
use crate::{
    CompletionRequest, CompletionResponse, LlmProvider, Message, MessageRole, ModelEntry,
    COMPLETION_TIMEOUT_SECS, DISCOVERY_TIMEOUT_SECS,
};

/// Adapter for the OpenAI-compatible wire family.
#[derive(Clone)]
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    default_model: String,
    client: Client,
}

impl OpenAiCompatProvider {
    /// Create a new adapter. `base_url` is the API root, without the
    /// trailing `/chat/completions`.
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

    fn resolve_model(&self, requested: &str) -> String {
        if requested.is_empty() {
            self.default_model.clone()
        } else {
            requested.to_string()
        }
    }
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let model = self.resolve_model(&request.model);
        let body = build_request_body(&model, &request);

        debug!(provider = %self.name, %model, "sending chat completion request");
        let started = Instant::now();

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
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

        let parsed: ChatResponse = response.json().await.map_err(|e| ProviderError::Wire {
            provider: self.name.clone(),
            model: model.clone(),
            detail: format!("decode error: {e}"),
        })?;
        let latency_ms = started.elapsed().as_millis() as u64;

        parse_response(&self.name, &model, parsed, latency_ms)
    }

    async fn list_models(&self) -> Result<Vec<ModelEntry>, ProviderError> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(Duration::from_secs(DISCOVERY_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| ProviderError::Wire {
                provider: self.name.clone(),
                model: String::new(),
                detail: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Wire {
                provider: self.name.clone(),
                model: String::new(),
                detail: format!("HTTP {status}: {}", truncate_body(&body)),
            });
        }

        let parsed: ModelListResponse =
            response.json().await.map_err(|e| ProviderError::Wire {
                provider: self.name.clone(),
                model: String::new(),
                detail: format!("decode error: {e}"),
            })?;

        Ok(parsed
            .data
            .into_iter()
            .map(|m| ModelEntry {
                name: m.id,
                display_name: None,
                context_window: None,
            })
            .collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request and Response Wire Format
// ─────────────────────────────────────────────────────────────────────────────

fn build_request_body(model: &str, request: &CompletionRequest) -> serde_json::Value {
    let mut body = json!({
        "model": model,
        "messages": convert_messages(&request.messages),
    });

    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(top_p) = request.top_p {
        body["top_p"] = json!(top_p);
    }
    if let Some(seed) = request.seed {
        body["seed"] = json!(seed);
    }

    body
}

fn convert_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|msg| {
            json!({
                "role": match msg.role {
                    MessageRole::System => "system",
                    MessageRole::User => "user",
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
    parsed: ChatResponse,
    latency_ms: u64,
) -> Result<CompletionResponse, ProviderError> {
    let choice = parsed.choices.first().ok_or_else(|| ProviderError::Wire {
        provider: provider.to_string(),
        model: model.to_string(),
        detail: "response contained no choices".to_string(),
    })?;

    let usage = parsed.usage.unwrap_or_default();
    Ok(CompletionResponse {
        provider: provider.to_string(),
        model: parsed.model.unwrap_or_else(|| model.to_string()),
        content: choice.message.content.clone().unwrap_or_default(),
        tokens_in: usage.prompt_tokens,
        tokens_out: usage.completion_tokens,
        finish_reason: choice.finish_reason.clone(),
        latency_ms,
    })
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ModelListResponse {
    data: Vec<ModelListEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelListEntry {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CompletionRequest {
        CompletionRequest {
            model: "m1".into(),
            messages: vec![
                Message::system("Be rigorous."),
                Message::user("Attack this claim."),
            ],
            temperature: Some(0.2),
            max_tokens: Some(512),
            top_p: None,
            seed: Some(7),
        }
    }

    #[test]
    fn test_request_body_shape() {
        let body = build_request_body("m1", &request());
        assert_eq!(body["model"], "m1");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "Attack this claim.");
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["seed"], 7);
        assert!(body.get("top_p").is_none());
    }

    #[test]
    fn test_parse_response_picks_first_choice() {
        let parsed: ChatResponse = serde_json::from_str(
            r#"{
                "model": "m1-0125",
                "choices": [{"message": {"content": "refuted"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 3}
            }"#,
        )
        .unwrap();

        let response = parse_response("vendor", "m1", parsed, 88).unwrap();
        assert_eq!(response.content, "refuted");
        assert_eq!(response.model, "m1-0125");
        assert_eq!(response.tokens_in, 12);
        assert_eq!(response.tokens_out, 3);
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_empty_choices_is_wire_error() {
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"model": null, "choices": [], "usage": null}"#).unwrap();
        let err = parse_response("vendor", "m1", parsed, 10).unwrap_err();
        assert!(matches!(err, ProviderError::Wire { .. }));
    }

    #[test]
    fn test_missing_usage_defaults_to_zero() {
        let parsed: ChatResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"content": "ok"}, "finish_reason": null}], "usage": null, "model": null}"#,
        )
        .unwrap();
        let response = parse_response("vendor", "m1", parsed, 5).unwrap();
        assert_eq!(response.tokens_in, 0);
        assert_eq!(response.tokens_out, 0);
        assert_eq!(response.model, "m1");
    }
}
