//! Executors for the four step kinds.

use futures_util::StreamExt;
use tracing::{debug, warn};

use crucible_providers::{truncate_at, CompletionRequest, Message};
use crucible_store::{new_id, FlowStep, StepKind, WorkflowStep};

use crate::context::FlowContext;
use crate::engine::WorkflowEngine;
use crate::error::EngineError;
use crate::template::render;

/// Cap on an `http` step's response body.
pub(crate) const HTTP_BODY_LIMIT: usize = 1024 * 1024;
/// How much of an error body an `http` step failure carries.
const HTTP_ERROR_BODY_LIMIT: usize = 500;

/// What a successful step attempt produced.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub output: String,
    pub model_used: Option<String>,
    pub provider_used: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
}

impl WorkflowEngine {
    pub(crate) async fn execute_step_kind(
        &self,
        run_id: &str,
        node_id: Option<&str>,
        step_run_id: &str,
        step: &WorkflowStep,
        ctx: &FlowContext,
    ) -> Result<StepOutcome, EngineError> {
        match step.kind {
            StepKind::Llm => self.execute_llm(run_id, node_id, step_run_id, step, ctx).await,
            StepKind::Check => {
                self.execute_check(run_id, node_id, step_run_id, step, ctx)
                    .await
            }
            StepKind::Sql => self.execute_sql(step, ctx).await,
            StepKind::Http => self.execute_http(step, ctx).await,
        }
    }

    async fn execute_llm(
        &self,
        run_id: &str,
        node_id: Option<&str>,
        step_run_id: &str,
        step: &WorkflowStep,
        ctx: &FlowContext,
    ) -> Result<StepOutcome, EngineError> {
        let prompt = render(step.prompt.as_deref().unwrap_or(""), ctx);
        let system = render(step.system_prompt.as_deref().unwrap_or(""), ctx);
        self.dispatch_completion(run_id, node_id, step_run_id, step, prompt, system)
            .await
    }

    async fn execute_check(
        &self,
        run_id: &str,
        node_id: Option<&str>,
        step_run_id: &str,
        step: &WorkflowStep,
        ctx: &FlowContext,
    ) -> Result<StepOutcome, EngineError> {
        let list_id = step
            .criteria_list_id
            .as_deref()
            .ok_or_else(|| EngineError::CriteriaList("<none configured>".to_string()))?;
        let list = self
            .store
            .get_criteria_list(list_id)?
            .ok_or_else(|| EngineError::CriteriaList(list_id.to_string()))?;

        // The step template, when present, selects what gets evaluated;
        // otherwise the previous step's output, falling back to the body.
        let subject = match &step.prompt {
            Some(template) => render(template, ctx),
            None if !ctx.previous_response.is_empty() => ctx.previous_response.clone(),
            None => ctx.body.clone(),
        };

        let prompt = build_check_prompt(&list.criteria, &subject);
        let system = render(step.system_prompt.as_deref().unwrap_or(""), ctx);
        self.dispatch_completion(run_id, node_id, step_run_id, step, prompt, system)
            .await
    }

    /// Dispatch a rendered prompt to the provider layer and persist the
    /// forensic flow-step record.
    async fn dispatch_completion(
        &self,
        run_id: &str,
        node_id: Option<&str>,
        step_run_id: &str,
        step: &WorkflowStep,
        prompt: String,
        system: String,
    ) -> Result<StepOutcome, EngineError> {
        let mut messages = Vec::new();
        if !system.is_empty() {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(prompt.clone()));

        let request =
            CompletionRequest::new(step.model.clone().unwrap_or_default(), messages);
        let response = match step.provider.as_deref() {
            Some(provider) => self.registry.complete_via(provider, request).await?,
            None => self.registry.complete(request).await?,
        };

        let record = FlowStep {
            id: new_id(),
            flow_id: run_id.to_string(),
            step_index: step.rank,
            node_id: node_id.map(str::to_string),
            model: response.model.clone(),
            provider: response.provider.clone(),
            prompt,
            system_prompt: system,
            response_raw: serde_json::to_string(&response)?,
            response_parsed: Some(response.content.clone()),
            tokens_in: response.tokens_in as i64,
            tokens_out: response.tokens_out as i64,
            latency_ms: response.latency_ms as i64,
            finish_reason: response.finish_reason.clone(),
            error: None,
            replay_of: None,
            dispatch_id: Some(step_run_id.to_string()),
            created_at: chrono::Utc::now(),
        };
        if let Err(e) = self.store.insert_flow_step(&record) {
            warn!(step = %step.name, "failed to persist flow step record: {e}");
        }

        Ok(StepOutcome {
            output: response.content,
            model_used: Some(response.model),
            provider_used: Some(response.provider),
            tokens_in: response.tokens_in as i64,
            tokens_out: response.tokens_out as i64,
        })
    }

    async fn execute_sql(
        &self,
        step: &WorkflowStep,
        ctx: &FlowContext,
    ) -> Result<StepOutcome, EngineError> {
        let query = render(step.prompt.as_deref().unwrap_or(""), ctx);
        if !query.trim().to_uppercase().starts_with("SELECT") {
            return Err(EngineError::SqlForbidden(truncate_at(query.trim(), 120)));
        }

        let store = self.store.clone();
        let rows = tokio::task::spawn_blocking(move || store.query_select(&query))
            .await
            .map_err(|e| EngineError::Internal(format!("sql task failed: {e}")))??;

        Ok(StepOutcome {
            output: serde_json::to_string(&rows)?,
            ..StepOutcome::default()
        })
    }

    async fn execute_http(
        &self,
        step: &WorkflowStep,
        ctx: &FlowContext,
    ) -> Result<StepOutcome, EngineError> {
        let url = render(step.prompt.as_deref().unwrap_or(""), ctx);
        let method_name = step
            .config
            .get("method")
            .map(|m| m.to_uppercase())
            .unwrap_or_else(|| "GET".to_string());
        let method = reqwest::Method::from_bytes(method_name.as_bytes())
            .map_err(|_| EngineError::Internal(format!("invalid http method: {method_name}")))?;

        let mut request = self.http.request(method, url.as_str());
        if let Some(authorization) = step.config.get("authorization") {
            request = request.header("Authorization", authorization);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::HttpTransport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::HttpStatus {
                status: status.as_u16(),
                body: truncate_at(&body, HTTP_ERROR_BODY_LIMIT),
            });
        }

        let output = read_capped(response, HTTP_BODY_LIMIT).await?;
        Ok(StepOutcome {
            output,
            ..StepOutcome::default()
        })
    }
}

/// Stream a response body into memory, stopping at `limit` bytes.
async fn read_capped(response: reqwest::Response, limit: usize) -> Result<String, EngineError> {
    let mut stream = response.bytes_stream();
    let mut collected: Vec<u8> = Vec::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| EngineError::HttpTransport(e.to_string()))?;
        let remaining = limit - collected.len();
        if chunk.len() >= remaining {
            collected.extend_from_slice(&chunk[..remaining]);
            debug!("http step body truncated at {limit} bytes");
            break;
        }
        collected.extend_from_slice(&chunk);
    }

    Ok(String::from_utf8_lossy(&collected).into_owned())
}

/// Build the deterministic evaluation prompt of a `check` step.
pub(crate) fn build_check_prompt(criteria: &[String], subject: &str) -> String {
    let mut prompt = String::from(
        "Evaluate the text below against each criterion, in order.\n\nText under evaluation:\n",
    );
    prompt.push_str(subject);
    prompt.push_str("\n\nCriteria:\n");
    for (index, criterion) in criteria.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", index + 1, criterion));
    }
    prompt.push_str(
        "\nRespond with only a JSON array, one object per criterion, in the same order:\n\
         [{\"criterion\": \"<criterion text>\", \"result\": \"PASS\" or \"FAIL\", \
         \"justification\": \"<one sentence>\"}]",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_prompt_is_deterministic_and_ordered() {
        let criteria = vec![
            "States the claim explicitly.".to_string(),
            "Cites at least one source.".to_string(),
        ];
        let first = build_check_prompt(&criteria, "Claim X");
        let second = build_check_prompt(&criteria, "Claim X");
        assert_eq!(first, second);

        let one = first.find("1. States the claim explicitly.").unwrap();
        let two = first.find("2. Cites at least one source.").unwrap();
        assert!(one < two);
        assert!(first.contains("\"result\": \"PASS\" or \"FAIL\""));
    }

    #[test]
    fn test_check_prompt_contains_subject() {
        let prompt = build_check_prompt(&["c".to_string()], "the text under test");
        assert!(prompt.contains("the text under test"));
    }
}
