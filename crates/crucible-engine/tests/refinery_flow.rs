//! Challenge/resolution wrappers driving the engine end to end.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crucible_engine::{ClaimNode, Principal, Refinery, WorkflowEngine};
use crucible_providers::{
    CompletionRequest, CompletionResponse, LlmProvider, ModelEntry, ProviderError,
    ProviderRegistry,
};
use crucible_store::{
    new_id, ForensicStore, MetricsStore, RunStatus, StepKind, Workflow, WorkflowStatus,
    WorkflowStep,
};

/// Echoes the rendered user prompt back as content.
struct EchoProvider;

#[async_trait::async_trait]
impl LlmProvider for EchoProvider {
    fn name(&self) -> &str {
        "vendor"
    }

    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        Ok(CompletionResponse {
            provider: "vendor".into(),
            model: request.model,
            content: request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default(),
            tokens_in: 1,
            tokens_out: 1,
            finish_reason: Some("stop".into()),
            latency_ms: 1,
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelEntry>, ProviderError> {
        Ok(vec![])
    }
}

fn refinery_with_workflow(name: &str) -> (Refinery, ForensicStore, String) {
    let store = ForensicStore::open_in_memory().unwrap();
    let metrics = MetricsStore::open_in_memory().unwrap();
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(EchoProvider));
    let engine = WorkflowEngine::new(store.clone(), metrics, Arc::new(registry)).unwrap();

    let now = chrono::Utc::now();
    let workflow_id = new_id();
    let workflow = Workflow {
        id: workflow_id.clone(),
        name: name.to_string(),
        description: String::new(),
        kind: "challenge".into(),
        owner_id: "alice".into(),
        owner_role: "member".into(),
        status: WorkflowStatus::Draft,
        version: 1,
        pre_prompt: None,
        validated_by: None,
        rejection_reason: None,
        created_at: now,
        updated_at: now,
    };
    let step = WorkflowStep {
        id: new_id(),
        workflow_id: workflow_id.clone(),
        rank: 1,
        name: "attack".into(),
        kind: StepKind::Llm,
        provider: None,
        model: Some("vendor/m1".into()),
        prompt: Some("{{.Body}}".into()),
        system_prompt: None,
        config: HashMap::new(),
        criteria_list_id: None,
        timeout_ms: 5_000,
        retry_max: 1,
        fan_group: None,
    };
    store.insert_workflow(&workflow, &[step]).unwrap();
    store
        .update_workflow_status(&workflow_id, WorkflowStatus::Active, Some("validator"), None)
        .unwrap();

    (Refinery::new(engine), store, workflow_id)
}

fn principal() -> Principal {
    Principal {
        user_id: "alice".into(),
        role: "member".into(),
    }
}

#[tokio::test]
async fn challenge_flattens_the_claim_tree() {
    let (refinery, store, workflow_id) = refinery_with_workflow("challenge-claim");
    let node = ClaimNode::claim("n1", "Root claim")
        .with_child(ClaimNode::piece("n2", "Supporting piece"));

    let run_id = refinery
        .challenge(
            &workflow_id,
            &node,
            &principal(),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let run = store.get_run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.node_id.as_deref(), Some("n1"));
    assert!(run.batch_id.is_some());

    let result: HashMap<String, String> =
        serde_json::from_str(run.result.as_deref().unwrap()).unwrap();
    assert_eq!(result["attack"], "Root claim\n  - Supporting piece");
}

#[tokio::test]
async fn resolve_appends_challenge_outputs() {
    let (refinery, store, workflow_id) = refinery_with_workflow("resolve-claim");
    let node = ClaimNode::claim("n1", "Root claim");
    let challenges = vec!["It lacks a source.".to_string(), "Its scope is vague.".to_string()];

    let run_id = refinery
        .resolve(
            &workflow_id,
            &node,
            &challenges,
            &principal(),
            None,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let run = store.get_run(&run_id).unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let result: HashMap<String, String> =
        serde_json::from_str(run.result.as_deref().unwrap()).unwrap();
    let body = &result["attack"];
    assert!(body.starts_with("Root claim"));
    assert!(body.contains("Challenges raised:"));
    assert!(body.contains("1. It lacks a source."));
    assert!(body.contains("2. Its scope is vague."));
}
