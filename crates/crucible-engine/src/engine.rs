//! The workflow engine: stage grouping, fan-out/fan-in, retries,
//! timeouts, grant enforcement, and per-step persistence.

use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crucible_providers::ProviderRegistry;
use crucible_store::{
    new_id, AuditKind, ForensicStore, MetricsStore, RunMetric, RunStatus, StepMetric,
    StepRunOutcome, StepRunStatus, Workflow, WorkflowRun, WorkflowStatus, WorkflowStep,
    WorkflowStepRun,
};

use crate::context::FlowContext;
use crate::error::EngineError;
use crate::grants;
use crate::steps::StepOutcome;

/// Timeout for the engine's `http` step client.
const HTTP_STEP_TIMEOUT_SECS: u64 = 60;
/// Linear backoff unit between retry attempts.
const RETRY_BACKOFF_STEP_MS: u64 = 100;

/// Input to one workflow execution.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub workflow_id: String,
    pub node_id: Option<String>,
    pub user_id: String,
    pub role: String,
    /// Instance-level pre-prompt; overrides the workflow's own.
    pub pre_prompt: Option<String>,
    pub body: String,
    pub batch_id: Option<String>,
}

/// The engine. Cloning is cheap; clones share stores and registry, which
/// is how fan-out siblings get their handles.
#[derive(Clone)]
pub struct WorkflowEngine {
    pub(crate) store: ForensicStore,
    pub(crate) metrics: MetricsStore,
    pub(crate) registry: Arc<ProviderRegistry>,
    pub(crate) http: reqwest::Client,
}

impl WorkflowEngine {
    pub fn new(
        store: ForensicStore,
        metrics: MetricsStore,
        registry: Arc<ProviderRegistry>,
    ) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_STEP_TIMEOUT_SECS))
            .build()
            .map_err(|e| EngineError::Internal(format!("failed to build http client: {e}")))?;

        Ok(Self {
            store,
            metrics,
            registry,
            http,
        })
    }

    pub fn store(&self) -> &ForensicStore {
        &self.store
    }

    /// Execute a workflow to a terminal state and return the run id.
    ///
    /// Step failures and cancellation are recorded on the run rather than
    /// returned: callers poll run status through the store. An `Err` here
    /// means the run could not even be created.
    pub async fn execute(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> Result<String, EngineError> {
        let workflow = self.store.get_workflow(&request.workflow_id)?;
        if workflow.status != WorkflowStatus::Active {
            return Err(EngineError::Internal(format!(
                "workflow {} is {}, not active",
                workflow.name,
                workflow.status.as_str()
            )));
        }
        let steps = self.store.list_steps(&workflow.id)?;

        let run_id = new_id();
        let pre_prompt = request
            .pre_prompt
            .clone()
            .or_else(|| workflow.pre_prompt.clone());
        self.store.create_run(&WorkflowRun {
            id: run_id.clone(),
            workflow_id: workflow.id.clone(),
            node_id: request.node_id.clone(),
            user_id: request.user_id.clone(),
            status: RunStatus::Pending,
            pre_prompt: pre_prompt.clone(),
            batch_id: request.batch_id.clone(),
            total_steps: steps.len() as i64,
            completed_steps: 0,
            result: None,
            error: None,
            started_at: chrono::Utc::now(),
            completed_at: None,
        })?;
        self.store.mark_run_running(&run_id)?;
        let _ = self.store.record_audit(
            Some(run_id.as_str()),
            None,
            AuditKind::RunStarted,
            Some(&json!({"workflow": workflow.name, "total_steps": steps.len()})),
        );
        info!(run_id = %run_id, workflow = %workflow.name, "run started");

        let started = Instant::now();
        let mut ctx = FlowContext::new(request.body.clone(), pre_prompt.unwrap_or_default());

        let mut stages: BTreeMap<i64, Vec<WorkflowStep>> = BTreeMap::new();
        for step in steps {
            stages.entry(step.rank).or_default().push(step);
        }

        for (rank, group) in stages {
            if cancel.is_cancelled() {
                return self.settle(
                    &run_id,
                    &workflow,
                    RunStatus::Cancelled,
                    None,
                    Some("cancelled"),
                    started,
                );
            }

            let stage_error = if group.len() == 1 {
                let step = &group[0];
                match self
                    .run_step(&run_id, &request, step, &ctx, &cancel)
                    .await
                {
                    Ok(outcome) => {
                        ctx.record_step(step.name.clone(), outcome.output);
                        None
                    }
                    Err(e) => Some(e),
                }
            } else {
                self.run_stage_parallel(&run_id, &request, rank, group, &mut ctx, &cancel)
                    .await
            };

            if let Some(error) = stage_error {
                if cancel.is_cancelled() {
                    return self.settle(
                        &run_id,
                        &workflow,
                        RunStatus::Cancelled,
                        None,
                        Some("cancelled"),
                        started,
                    );
                }
                return self.settle(
                    &run_id,
                    &workflow,
                    RunStatus::Failed,
                    None,
                    Some(&error.to_string()),
                    started,
                );
            }
        }

        // Stable key order for the result blob.
        let result: BTreeMap<&String, &String> = ctx.outputs().iter().collect();
        let result_json = serde_json::to_string(&result)?;
        self.settle(
            &run_id,
            &workflow,
            RunStatus::Completed,
            Some(&result_json),
            None,
            started,
        )
    }

    /// Fan a stage group out to sibling tasks and join them all. Sibling
    /// failures do not cancel the rest of the group; the first error is
    /// reported after the join.
    async fn run_stage_parallel(
        &self,
        run_id: &str,
        request: &RunRequest,
        rank: i64,
        group: Vec<WorkflowStep>,
        ctx: &mut FlowContext,
        cancel: &CancellationToken,
    ) -> Option<EngineError> {
        let count = group.len();
        let _ = self.store.record_audit(
            Some(run_id),
            None,
            AuditKind::FanOutStarted,
            Some(&json!({"rank": rank, "count": count})),
        );
        debug!(rank, count, "fanning out stage group");

        let mut join: JoinSet<(String, Result<StepOutcome, EngineError>)> = JoinSet::new();
        for step in group {
            let engine = self.clone();
            let request = request.clone();
            let sibling_ctx = ctx.clone();
            let run_id = run_id.to_string();
            let cancel = cancel.clone();
            join.spawn(async move {
                let result = engine
                    .run_step(&run_id, &request, &step, &sibling_ctx, &cancel)
                    .await;
                (step.name, result)
            });
        }

        let _ = self.store.record_audit(
            Some(run_id),
            None,
            AuditKind::FanInWaiting,
            Some(&json!({"rank": rank})),
        );

        let mut completed: Vec<(String, String)> = Vec::new();
        let mut first_error: Option<EngineError> = None;
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok((name, Ok(outcome))) => completed.push((name, outcome.output)),
                Ok((_, Err(e))) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error =
                            Some(EngineError::Internal(format!("sibling task failed: {e}")));
                    }
                }
            }
        }

        // Merge sibling outputs single-writer. previous_response ends up
        // as whichever sibling merged last; the order is unspecified.
        let mut fan_results = serde_json::Map::new();
        for (name, output) in &completed {
            ctx.record_step(name.clone(), output.clone());
            fan_results.insert(name.clone(), serde_json::Value::String(output.clone()));
        }
        ctx.set_fan_results(serde_json::Value::Object(fan_results).to_string());

        let _ = self.store.record_audit(
            Some(run_id),
            None,
            AuditKind::FanInCompleted,
            Some(&json!({"rank": rank, "completed": completed.len()})),
        );

        first_error
    }

    /// Execute one step as an ACID unit: insert the step run, enforce
    /// grants, attempt with timeout and linear backoff, persist the
    /// terminal state.
    async fn run_step(
        &self,
        run_id: &str,
        request: &RunRequest,
        step: &WorkflowStep,
        ctx: &FlowContext,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, EngineError> {
        let step_run_id = new_id();
        self.store.insert_step_run(&WorkflowStepRun {
            id: step_run_id.clone(),
            run_id: run_id.to_string(),
            step_id: step.id.clone(),
            rank: step.rank,
            status: StepRunStatus::Running,
            input: Some(ctx.input_blob().to_string()),
            output: None,
            model_used: None,
            provider_used: None,
            tokens_in: 0,
            tokens_out: 0,
            latency_ms: 0,
            error: None,
            attempts: 0,
            started_at: chrono::Utc::now(),
            completed_at: None,
        })?;
        let _ = self.store.record_audit(
            Some(run_id),
            Some(step_run_id.as_str()),
            AuditKind::StepStarted,
            Some(&json!({"step": step.name, "rank": step.rank})),
        );

        if let Err(e) = self.check_grants(&request.user_id, &request.role, step) {
            self.persist_step_failure(run_id, &step_run_id, &step.name, &e, 0, 0);
            return Err(e);
        }

        let max_attempts = step.retry_max.max(1) as u32;
        let timeout = Duration::from_millis(step.timeout_ms.max(1) as u64);
        let mut last_error = EngineError::Internal("step never attempted".to_string());
        let mut last_latency = 0i64;
        let mut attempt = 0u32;

        while attempt < max_attempts {
            attempt += 1;
            let attempt_started = Instant::now();
            let outcome = tokio::time::timeout(
                timeout,
                self.execute_step_kind(
                    run_id,
                    request.node_id.as_deref(),
                    &step_run_id,
                    step,
                    ctx,
                ),
            )
            .await;
            let latency_ms = attempt_started.elapsed().as_millis() as i64;

            match outcome {
                Ok(Ok(result)) => {
                    self.persist_step_success(run_id, &step_run_id, step, &result, latency_ms, attempt);
                    return Ok(result);
                }
                Ok(Err(e)) => last_error = e,
                Err(_) => last_error = EngineError::StepTimeout(step.timeout_ms),
            }
            last_latency = latency_ms;

            // Fatal errors never retry, and a fired cancellation signal
            // means no further attempts start.
            if last_error.is_fatal() || attempt >= max_attempts || cancel.is_cancelled() {
                break;
            }

            let _ = self.store.record_audit(
                Some(run_id),
                Some(step_run_id.as_str()),
                AuditKind::StepRetried,
                Some(&json!({"step": step.name, "attempt": attempt, "error": last_error.to_string()})),
            );
            tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_STEP_MS * attempt as u64))
                .await;
        }

        let final_error = if last_error.is_fatal() {
            last_error
        } else {
            EngineError::StepExhausted {
                attempts: attempt,
                last: last_error.to_string(),
            }
        };
        self.persist_step_failure(
            run_id,
            &step_run_id,
            &step.name,
            &final_error,
            last_latency,
            attempt as i64,
        );
        Err(final_error)
    }

    /// Run-time grant check, only for steps that name a model.
    fn check_grants(
        &self,
        user_id: &str,
        role: &str,
        step: &WorkflowStep,
    ) -> Result<(), EngineError> {
        let Some(model_id) = step.model.as_deref() else {
            return Ok(());
        };

        let mut owned = false;
        if let Some(model) = self.store.get_model(model_id)? {
            if !model.available {
                return Err(EngineError::ModelUnavailable(model_id.to_string()));
            }
            owned = model.owner_id.is_some();
        }

        let grants = self.store.list_grants_for(user_id, role)?;
        let decision = grants::evaluate(user_id, role, model_id, step.kind.as_str(), &grants);

        // Explicit deny always wins. With no matching rule at all, an
        // ownerless (auto-discovered) model is globally allowed; an owned
        // one is not.
        if (decision.explicit && !decision.allowed) || (!decision.explicit && owned) {
            return Err(EngineError::GrantDenied {
                model: model_id.to_string(),
                step_kind: step.kind.as_str().to_string(),
            });
        }
        Ok(())
    }

    fn persist_step_success(
        &self,
        run_id: &str,
        step_run_id: &str,
        step: &WorkflowStep,
        result: &StepOutcome,
        latency_ms: i64,
        attempt: u32,
    ) {
        let outcome = StepRunOutcome {
            output: result.output.clone(),
            model_used: result.model_used.clone(),
            provider_used: result.provider_used.clone(),
            tokens_in: result.tokens_in,
            tokens_out: result.tokens_out,
            latency_ms,
            attempts: attempt as i64,
        };
        // A transient persistence error must not mask the step result;
        // log it and leave a trace in the audit log.
        if let Err(e) = self.store.complete_step_run(step_run_id, &outcome) {
            warn!(step = %step.name, "failed to persist step outcome: {e}");
            let _ = self.store.record_audit(
                Some(run_id),
                Some(step_run_id),
                AuditKind::StoreWriteFailed,
                Some(&json!({"error": e.to_string()})),
            );
        }
        if let Err(e) = self.store.increment_completed_steps(run_id) {
            warn!(run_id, "failed to bump completed steps: {e}");
            let _ = self.store.record_audit(
                Some(run_id),
                Some(step_run_id),
                AuditKind::StoreWriteFailed,
                Some(&json!({"error": e.to_string()})),
            );
        }
        let _ = self.store.record_audit(
            Some(run_id),
            Some(step_run_id),
            AuditKind::StepCompleted,
            Some(&json!({
                "step": step.name,
                "tokens_in": result.tokens_in,
                "tokens_out": result.tokens_out,
                "latency_ms": latency_ms,
            })),
        );
        self.metrics.record_step(&StepMetric {
            run_id: run_id.to_string(),
            step_name: step.name.clone(),
            provider: result.provider_used.clone(),
            model: result.model_used.clone(),
            tokens_in: result.tokens_in,
            tokens_out: result.tokens_out,
            latency_ms,
        });
    }

    fn persist_step_failure(
        &self,
        run_id: &str,
        step_run_id: &str,
        step_name: &str,
        error: &EngineError,
        latency_ms: i64,
        attempts: i64,
    ) {
        if let Err(e) =
            self.store
                .fail_step_run(step_run_id, &error.to_string(), latency_ms, attempts)
        {
            warn!(step = step_name, "failed to persist step failure: {e}");
            let _ = self.store.record_audit(
                Some(run_id),
                Some(step_run_id),
                AuditKind::StoreWriteFailed,
                Some(&json!({"error": e.to_string()})),
            );
        }
        let _ = self.store.record_audit(
            Some(run_id),
            Some(step_run_id),
            AuditKind::StepFailed,
            Some(&json!({"step": step_name, "error": error.to_string()})),
        );
    }

    fn settle(
        &self,
        run_id: &str,
        workflow: &Workflow,
        status: RunStatus,
        result: Option<&str>,
        error: Option<&str>,
        started: Instant,
    ) -> Result<String, EngineError> {
        self.store.finish_run(run_id, status, result, error)?;
        match status {
            RunStatus::Completed => {
                let _ = self.store.record_audit(
                    Some(run_id),
                    None,
                    AuditKind::RunCompleted,
                    None,
                );
            }
            RunStatus::Cancelled => {
                let _ = self.store.record_audit(
                    Some(run_id),
                    None,
                    AuditKind::RunCancelled,
                    None,
                );
            }
            _ => {}
        }

        let run = self.store.get_run(run_id)?;
        self.metrics.record_run(&RunMetric {
            run_id: run_id.to_string(),
            workflow_id: workflow.id.clone(),
            status: status.as_str().to_string(),
            total_steps: run.total_steps,
            completed_steps: run.completed_steps,
            duration_ms: started.elapsed().as_millis() as i64,
        });
        info!(run_id, status = status.as_str(), "run settled");
        Ok(run_id.to_string())
    }
}
