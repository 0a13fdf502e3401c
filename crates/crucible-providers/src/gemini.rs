//! Gemini-style provider adapter.
//!
//! Differences bridged here: the key travels as a query parameter, the
//! assistant role is called `model`, system messages become a top-level
//! `systemInstruction`, and the text lives in
//! `candidates[0].content.parts[*].text`.

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

/// Adapter for Gemini-style backends.
#[derive(Clone)]
pub struct GeminiProvider {
    name: String,
    base_url: String,
    api_key: String,
    default_model: String,
    client: Client,
}

impl GeminiProvider {
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
impl LlmProvider for GeminiProvider {
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
        let body = build_request_body(&request);

        debug!(provider = %self.name, %model, "sending generateContent request");
        let started = Instant::now();

        let response = self
            .client
            .post(format!(
                "{}/models/{}:generateContent",
                self.base_url, model
            ))
            .query(&[("key", self.api_key.as_str())])
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

        let parsed: GenerateResponse =
            response.json().await.map_err(|e| ProviderError::Wire {
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
            .query(&[("key", self.api_key.as_str())])
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
            .models
            .into_iter()
            .map(|m| ModelEntry {
                // The listing returns names as "models/<name>".
                name: m.name.strip_prefix("models/").unwrap_or(&m.name).to_string(),
                display_name: m.display_name,
                context_window: m.input_token_limit,
            })
            .collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request and Response Wire Format
// ─────────────────────────────────────────────────────────────────────────────

fn build_request_body(request: &CompletionRequest) -> serde_json::Value {
    let system: String = request
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::System)
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let mut body = json!({
        "contents": convert_messages(&request.messages),
    });

    if !system.is_empty() {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }

    let mut generation_config = serde_json::Map::new();
    if let Some(temperature) = request.temperature {
        generation_config.insert("temperature".into(), json!(temperature));
    }
    if let Some(max_tokens) = request.max_tokens {
        generation_config.insert("maxOutputTokens".into(), json!(max_tokens));
    }
    if let Some(top_p) = request.top_p {
        generation_config.insert("topP".into(), json!(top_p));
    }
    if let Some(seed) = request.seed {
        generation_config.insert("seed".into(), json!(seed));
    }
    if !generation_config.is_empty() {
        body["generationConfig"] = serde_json::Value::Object(generation_config);
    }

    body
}

fn convert_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .filter(|m| m.role != MessageRole::System)
        .map(|msg| {
            json!({
                // Gemini calls the assistant role "model".
                "role": match msg.role {
                    MessageRole::Assistant => "model",
                    _ => "user",
                },
                "parts": [{ "text": msg.content }],
            })
        })
        .collect()
}

fn parse_response(
    provider: &str,
    model: &str,
    parsed: GenerateResponse,
    latency_ms: u64,
) -> Result<CompletionResponse, ProviderError> {
    let candidate = parsed
        .candidates
        .as_deref()
        .and_then(|c| c.first())
        .ok_or_else(|| ProviderError::Wire {
            provider: provider.to_string(),
            model: model.to_string(),
            detail: "response contained no candidates".to_string(),
        })?;

    let content: String = candidate
        .content
        .parts
        .iter()
        .filter_map(|part| part.text.as_deref())
        .collect();

    let usage = parsed.usage_metadata.unwrap_or_default();
    Ok(CompletionResponse {
        provider: provider.to_string(),
        model: model.to_string(),
        content,
        tokens_in: usage.prompt_token_count,
        tokens_out: usage.candidates_token_count,
        finish_reason: candidate.finish_reason.clone(),
        latency_ms,
    })
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct ModelListResponse {
    models: Vec<ModelListEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelListEntry {
    name: String,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    #[serde(rename = "inputTokenLimit")]
    input_token_limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assistant_role_renamed_to_model() {
        let request = CompletionRequest::new(
            "gemini-pro",
            vec![
                Message::system("Be terse."),
                Message::user("Attack this claim."),
                Message::assistant("Which part?"),
            ],
        );
        let body = build_request_body(&request);

        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "Be terse.");
    }

    #[test]
    fn test_generation_config_only_when_set() {
        let bare = CompletionRequest::new("gemini-pro", vec![Message::user("hi")]);
        assert!(build_request_body(&bare).get("generationConfig").is_none());

        let mut tuned = bare;
        tuned.temperature = Some(0.1);
        tuned.max_tokens = Some(256);
        let body = build_request_body(&tuned);
        assert_eq!(body["generationConfig"]["temperature"], 0.1);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 256);
    }

    #[test]
    fn test_parse_concatenates_parts() {
        let parsed: GenerateResponse = serde_json::from_str(
            r#"{
                "candidates": [{
                    "content": {"parts": [{"text": "first"}, {"text": " second"}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 6, "candidatesTokenCount": 2}
            }"#,
        )
        .unwrap();

        let response = parse_response("gemini", "gemini-pro", parsed, 30).unwrap();
        assert_eq!(response.content, "first second");
        assert_eq!(response.tokens_in, 6);
        assert_eq!(response.tokens_out, 2);
        assert_eq!(response.finish_reason.as_deref(), Some("STOP"));
    }

    #[test]
    fn test_no_candidates_is_wire_error() {
        let parsed: GenerateResponse = serde_json::from_str(r#"{"candidates": []}"#).unwrap();
        assert!(parse_response("gemini", "gemini-pro", parsed, 1).is_err());
    }
}
