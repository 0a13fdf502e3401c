//! crucible-store: durable storage for the Crucible knowledge refinery.
//!
//! Three logical stores, each an embedded SQLite database opened with
//! write-ahead logging, foreign keys, and a 5-second busy timeout:
//! - [`ForensicStore`] — workflows, runs, step runs, audit trail, model
//!   catalogue, grants, operator groups, criteria lists, and flow-step
//!   records.
//! - [`TreeStore`] — proof-tree nodes and votes.
//! - [`MetricsStore`] — best-effort step/run metrics.
//!
//! Schema evolution is additive and idempotent: repeated startup against
//! an already-migrated store is a no-op, and partial multi-row writes are
//! never observable.

mod catalog;
mod error;
mod forensic;
mod ids;
mod metrics;
mod runs;
mod schema;
mod time;
mod tree;
mod types;
mod workflows;

pub use error::{is_busy, Result, StoreError};
pub use forensic::ForensicStore;
pub use ids::new_id;
pub use metrics::{MetricsStore, RunMetric, StepMetric};
pub use runs::StepRunOutcome;
pub use tree::TreeStore;
pub use types::{
    AuditEvent, AuditKind, AvailableModel, CriteriaList, FlowStep, GrantEffect, GranteeKind,
    ModelGrant, OperatorGroup, RunStatus, RunView, StepKind, StepRunStatus, StepRunView, TreeNode,
    Vote, Workflow, WorkflowRun, WorkflowStatus, WorkflowStep, WorkflowStepRun,
};

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;
    use std::collections::HashMap;

    use crate::ids::new_id;
    use crate::types::{
        AvailableModel, GrantEffect, GranteeKind, ModelGrant, RunStatus, StepKind, StepRunStatus,
        Workflow, WorkflowRun, WorkflowStatus, WorkflowStep, WorkflowStepRun,
    };

    pub fn draft_workflow(name: &str) -> Workflow {
        let now = Utc::now();
        Workflow {
            id: new_id(),
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
        }
    }

    pub fn llm_step(workflow_id: &str, name: &str, rank: i64) -> WorkflowStep {
        WorkflowStep {
            id: new_id(),
            workflow_id: workflow_id.to_string(),
            rank,
            name: name.to_string(),
            kind: StepKind::Llm,
            provider: None,
            model: Some("vendor/m1".into()),
            prompt: Some("{{.Body}}".into()),
            system_prompt: None,
            config: HashMap::new(),
            criteria_list_id: None,
            timeout_ms: 120_000,
            retry_max: 1,
            fan_group: None,
        }
    }

    pub fn pending_run(workflow_id: &str, total_steps: i64) -> WorkflowRun {
        WorkflowRun {
            id: new_id(),
            workflow_id: workflow_id.to_string(),
            node_id: None,
            user_id: "alice".into(),
            status: RunStatus::Pending,
            pre_prompt: None,
            batch_id: None,
            total_steps,
            completed_steps: 0,
            result: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn running_step_run(run_id: &str, step_id: &str, rank: i64) -> WorkflowStepRun {
        WorkflowStepRun {
            id: new_id(),
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            rank,
            status: StepRunStatus::Running,
            input: Some(r#"{"body":"Claim X"}"#.into()),
            output: None,
            model_used: None,
            provider_used: None,
            tokens_in: 0,
            tokens_out: 0,
            latency_ms: 0,
            error: None,
            attempts: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn catalogue_model(provider: &str, name: &str, available: bool) -> AvailableModel {
        AvailableModel {
            id: format!("{provider}/{name}"),
            provider: provider.to_string(),
            name: name.to_string(),
            display_name: None,
            context_window: Some(128_000),
            available,
            last_checked_at: None,
            last_error: None,
            capabilities: None,
            discovered_at: Utc::now(),
            owner_id: None,
        }
    }

    pub fn user_grant(user: &str, model: &str, step_kind: &str, effect: GrantEffect) -> ModelGrant {
        ModelGrant {
            id: new_id(),
            grantee_kind: GranteeKind::User,
            grantee_id: user.to_string(),
            model: model.to_string(),
            step_kind: step_kind.to_string(),
            effect,
            created_by: "admin".into(),
            created_at: Utc::now(),
        }
    }
}
