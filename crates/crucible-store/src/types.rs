//! Entity types persisted by the forensic, tree, and metrics stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Result, StoreError};

/// Lifecycle state of a workflow definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Archived,
    Rejected,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Draft => "draft",
            WorkflowStatus::Active => "active",
            WorkflowStatus::Archived => "archived",
            WorkflowStatus::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "draft" => Ok(WorkflowStatus::Draft),
            "active" => Ok(WorkflowStatus::Active),
            "archived" => Ok(WorkflowStatus::Archived),
            "rejected" => Ok(WorkflowStatus::Rejected),
            other => Err(StoreError::InvalidValue {
                field: "workflow status",
                value: other.to_string(),
            }),
        }
    }
}

/// Kind of a workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Llm,
    Check,
    Sql,
    Http,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Llm => "llm",
            StepKind::Check => "check",
            StepKind::Sql => "sql",
            StepKind::Http => "http",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "llm" => Ok(StepKind::Llm),
            "check" => Ok(StepKind::Check),
            "sql" => Ok(StepKind::Sql),
            "http" => Ok(StepKind::Http),
            other => Err(StoreError::InvalidValue {
                field: "step kind",
                value: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle state of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(StoreError::InvalidValue {
                field: "run status",
                value: other.to_string(),
            }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Lifecycle state of a single step run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepRunStatus {
    Running,
    Completed,
    Failed,
}

impl StepRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepRunStatus::Running => "running",
            StepRunStatus::Completed => "completed",
            StepRunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "running" => Ok(StepRunStatus::Running),
            "completed" => Ok(StepRunStatus::Completed),
            "failed" => Ok(StepRunStatus::Failed),
            other => Err(StoreError::InvalidValue {
                field: "step run status",
                value: other.to_string(),
            }),
        }
    }
}

/// Who a model grant applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GranteeKind {
    User,
    Role,
}

impl GranteeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GranteeKind::User => "user",
            GranteeKind::Role => "role",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "user" => Ok(GranteeKind::User),
            "role" => Ok(GranteeKind::Role),
            other => Err(StoreError::InvalidValue {
                field: "grantee kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Effect of a model grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantEffect {
    Allow,
    Deny,
}

impl GrantEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantEffect::Allow => "allow",
            GrantEffect::Deny => "deny",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "allow" => Ok(GrantEffect::Allow),
            "deny" => Ok(GrantEffect::Deny),
            other => Err(StoreError::InvalidValue {
                field: "grant effect",
                value: other.to_string(),
            }),
        }
    }
}

/// Audit event kinds recorded along a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    RunStarted,
    StepStarted,
    StepRetried,
    FanOutStarted,
    FanInWaiting,
    FanInCompleted,
    StepFailed,
    StepCompleted,
    RunCompleted,
    RunCancelled,
    ModelDiscovered,
    StoreWriteFailed,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::RunStarted => "run_started",
            AuditKind::StepStarted => "step_started",
            AuditKind::StepRetried => "step_retried",
            AuditKind::FanOutStarted => "fan_out_started",
            AuditKind::FanInWaiting => "fan_in_waiting",
            AuditKind::FanInCompleted => "fan_in_completed",
            AuditKind::StepFailed => "step_failed",
            AuditKind::StepCompleted => "step_completed",
            AuditKind::RunCompleted => "run_completed",
            AuditKind::RunCancelled => "run_cancelled",
            AuditKind::ModelDiscovered => "model_discovered",
            AuditKind::StoreWriteFailed => "store_write_failed",
        }
    }
}

/// A workflow definition: an ordered list of steps owned by a principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Type tag, e.g. "challenge" or "resolution".
    pub kind: String,
    pub owner_id: String,
    pub owner_role: String,
    pub status: WorkflowStatus,
    pub version: i64,
    pub pre_prompt: Option<String>,
    pub validated_by: Option<String>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single step inside a workflow. Steps sharing a rank form a parallel
/// stage group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub id: String,
    pub workflow_id: String,
    pub rank: i64,
    pub name: String,
    pub kind: StepKind,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub prompt: Option<String>,
    pub system_prompt: Option<String>,
    /// Recognized option keys depend on the step kind; unknown keys are
    /// ignored.
    pub config: HashMap<String, String>,
    pub criteria_list_id: Option<String>,
    pub timeout_ms: i64,
    pub retry_max: i64,
    pub fan_group: Option<String>,
}

/// An ordered list of natural-language criteria evaluated by `check` steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriteriaList {
    pub id: String,
    pub name: String,
    pub description: String,
    pub criteria: Vec<String>,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One execution of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_id: String,
    pub node_id: Option<String>,
    pub user_id: String,
    pub status: RunStatus,
    pub pre_prompt: Option<String>,
    pub batch_id: Option<String>,
    pub total_steps: i64,
    pub completed_steps: i64,
    /// JSON mapping of step name to output, written on completion.
    pub result: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One execution of a single step within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepRun {
    pub id: String,
    pub run_id: String,
    pub step_id: String,
    pub rank: i64,
    pub status: StepRunStatus,
    pub input: Option<String>,
    pub output: Option<String>,
    pub model_used: Option<String>,
    pub provider_used: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub latency_ms: i64,
    pub error: Option<String>,
    pub attempts: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A catalogued model, keyed by `<provider>/<name>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableModel {
    pub id: String,
    pub provider: String,
    pub name: String,
    pub display_name: Option<String>,
    pub context_window: Option<i64>,
    pub available: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub capabilities: Option<String>,
    pub discovered_at: DateTime<Utc>,
    /// None means auto-discovered and globally accessible.
    pub owner_id: Option<String>,
}

/// A grant controlling whether a principal may use a model for a step kind.
///
/// `model` is a literal `<provider>/<name>`, a provider wildcard
/// `<provider>/*`, or the catch-all `*`. `step_kind` is a literal kind or
/// `*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelGrant {
    pub id: String,
    pub grantee_kind: GranteeKind,
    pub grantee_id: String,
    pub model: String,
    pub step_kind: String,
    pub effect: GrantEffect,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Forensic record of one rendered prompt and its response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStep {
    pub id: String,
    pub flow_id: String,
    pub step_index: i64,
    pub node_id: Option<String>,
    pub model: String,
    pub provider: String,
    pub prompt: String,
    pub system_prompt: String,
    pub response_raw: String,
    pub response_parsed: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub latency_ms: i64,
    pub finish_reason: Option<String>,
    pub error: Option<String>,
    pub replay_of: Option<String>,
    pub dispatch_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One row of the per-run audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: i64,
    pub run_id: Option<String>,
    pub step_run_id: Option<String>,
    pub kind: String,
    pub payload: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Provider-scoped container used for bulk grant management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorGroup {
    pub id: String,
    pub provider: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A node of the external proof tree. The engine only reads bodies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub node_type: String,
    pub body: String,
    pub visibility: String,
    pub author_id: String,
    pub created_at: DateTime<Utc>,
}

/// A vote on a tree node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub id: String,
    pub node_id: String,
    pub user_id: String,
    pub value: i64,
    pub created_at: DateTime<Utc>,
}

/// Caller-facing view of a run, joined with its workflow name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunView {
    pub id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    pub total_steps: i64,
    pub completed_steps: i64,
    pub result: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Caller-facing view of a step run, joined with its step definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRunView {
    pub id: String,
    pub step_name: String,
    pub kind: StepKind,
    pub status: StepRunStatus,
    pub input: Option<String>,
    pub output: Option<String>,
    pub model_used: Option<String>,
    pub provider_used: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub latency_ms: i64,
    pub attempts: i64,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(RunStatus::parse("bogus").is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_step_kind_parse() {
        assert_eq!(StepKind::parse("llm").unwrap(), StepKind::Llm);
        assert_eq!(StepKind::parse("http").unwrap(), StepKind::Http);
        assert!(StepKind::parse("grpc").is_err());
    }
}
