//! JSON workflow definitions for `crucible import`.

use anyhow::bail;
use serde::Deserialize;
use std::collections::HashMap;

use crucible_store::{new_id, StepKind, Workflow, WorkflowStatus, WorkflowStep};

/// On-disk workflow definition.
#[derive(Debug, Deserialize)]
pub struct WorkflowFile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default = "default_role")]
    pub owner_role: String,
    #[serde(default)]
    pub pre_prompt: Option<String>,
    pub steps: Vec<StepFile>,
}

fn default_kind() -> String {
    "challenge".to_string()
}

fn default_owner() -> String {
    "local".to_string()
}

fn default_role() -> String {
    "member".to_string()
}

/// One step in the file.
#[derive(Debug, Deserialize)]
pub struct StepFile {
    pub name: String,
    pub rank: i64,
    pub kind: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub criteria_list: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: i64,
    #[serde(default = "default_retry_max")]
    pub retry_max: i64,
    #[serde(default)]
    pub fan_group: Option<String>,
}

fn default_timeout_ms() -> i64 {
    120_000
}

fn default_retry_max() -> i64 {
    1
}

impl WorkflowFile {
    /// Convert the file into store records, validating step kinds and
    /// name uniqueness.
    pub fn into_records(self) -> anyhow::Result<(Workflow, Vec<WorkflowStep>)> {
        if self.steps.is_empty() {
            bail!("workflow {} has no steps", self.name);
        }

        let now = chrono::Utc::now();
        let workflow = Workflow {
            id: new_id(),
            name: self.name,
            description: self.description,
            kind: self.kind,
            owner_id: self.owner,
            owner_role: self.owner_role,
            status: WorkflowStatus::Draft,
            version: 1,
            pre_prompt: self.pre_prompt,
            validated_by: None,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        };

        let mut seen = std::collections::HashSet::new();
        let mut steps = Vec::with_capacity(self.steps.len());
        for step in self.steps {
            if !seen.insert(step.name.clone()) {
                bail!("duplicate step name: {}", step.name);
            }
            steps.push(WorkflowStep {
                id: new_id(),
                workflow_id: workflow.id.clone(),
                rank: step.rank,
                name: step.name,
                kind: StepKind::parse(&step.kind)?,
                provider: step.provider,
                model: step.model,
                prompt: step.prompt,
                system_prompt: step.system_prompt,
                config: step.config,
                criteria_list_id: step.criteria_list,
                timeout_ms: step.timeout_ms,
                retry_max: step.retry_max,
                fan_group: step.fan_group,
            });
        }

        Ok((workflow, steps))
    }
}
