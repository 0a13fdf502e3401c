//! Workflow definition persistence.
//!
//! A workflow exclusively owns its steps; deleting it cascades. Step
//! definitions are mutable only while the workflow is in `draft`.

use rusqlite::{params, OptionalExtension, Row};
use std::collections::HashMap;

use crate::error::{Result, StoreError};
use crate::forensic::ForensicStore;
use crate::time;
use crate::types::{StepKind, Workflow, WorkflowStatus, WorkflowStep};

impl ForensicStore {
    /// Insert a workflow together with its steps in one transaction.
    pub fn insert_workflow(&self, workflow: &Workflow, steps: &[WorkflowStep]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO workflows
                 (id, name, description, kind, owner_id, owner_role, status, version,
                  pre_prompt, validated_by, rejection_reason, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                workflow.id,
                workflow.name,
                workflow.description,
                workflow.kind,
                workflow.owner_id,
                workflow.owner_role,
                workflow.status.as_str(),
                workflow.version,
                workflow.pre_prompt,
                workflow.validated_by,
                workflow.rejection_reason,
                time::to_sql(&workflow.created_at),
                time::to_sql(&workflow.updated_at),
            ],
        )?;

        for step in steps {
            insert_step(&tx, step)?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Fetch a workflow by id.
    pub fn get_workflow(&self, id: &str) -> Result<Workflow> {
        let conn = self.conn();
        conn.query_row(
            &format!("{WORKFLOW_SELECT} WHERE id = ?1"),
            params![id],
            workflow_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            entity: "workflow",
            id: id.to_string(),
        })?
    }

    /// Fetch a workflow by its unique name.
    pub fn get_workflow_by_name(&self, name: &str) -> Result<Workflow> {
        let conn = self.conn();
        conn.query_row(
            &format!("{WORKFLOW_SELECT} WHERE name = ?1"),
            params![name],
            workflow_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            entity: "workflow",
            id: name.to_string(),
        })?
    }

    /// List all workflows, newest first.
    pub fn list_workflows(&self) -> Result<Vec<Workflow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{WORKFLOW_SELECT} ORDER BY created_at DESC"))?;
        let rows = stmt.query_map([], workflow_from_row)?;
        let mut workflows = Vec::new();
        for row in rows {
            workflows.push(row??);
        }
        Ok(workflows)
    }

    /// List a workflow's steps ordered by rank, then name for determinism
    /// within a stage group.
    pub fn list_steps(&self, workflow_id: &str) -> Result<Vec<WorkflowStep>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, workflow_id, rank, name, kind, provider, model, prompt,
                    system_prompt, config, criteria_list_id, timeout_ms, retry_max, fan_group
             FROM workflow_steps WHERE workflow_id = ?1 ORDER BY rank, name",
        )?;
        let rows = stmt.query_map(params![workflow_id], step_from_row)?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row??);
        }
        Ok(steps)
    }

    /// Transition a workflow's lifecycle state and bump its version.
    /// `active` records the validator; `rejected` records the reason.
    pub fn update_workflow_status(
        &self,
        id: &str,
        status: WorkflowStatus,
        validated_by: Option<&str>,
        rejection_reason: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE workflows
             SET status = ?2,
                 validated_by = COALESCE(?3, validated_by),
                 rejection_reason = ?4,
                 version = version + 1,
                 updated_at = ?5
             WHERE id = ?1",
            params![
                id,
                status.as_str(),
                validated_by,
                rejection_reason,
                time::to_sql(&chrono::Utc::now()),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "workflow",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Replace a draft workflow's steps in one transaction. Refused once
    /// the workflow has left `draft`.
    pub fn replace_steps(&self, workflow_id: &str, steps: &[WorkflowStep]) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM workflows WHERE id = ?1",
                params![workflow_id],
                |row| row.get(0),
            )
            .optional()?;
        match status.as_deref() {
            None => {
                return Err(StoreError::NotFound {
                    entity: "workflow",
                    id: workflow_id.to_string(),
                })
            }
            Some("draft") => {}
            Some(other) => {
                return Err(StoreError::InvalidValue {
                    field: "workflow status",
                    value: format!("steps are immutable once {other}"),
                })
            }
        }

        tx.execute(
            "DELETE FROM workflow_steps WHERE workflow_id = ?1",
            params![workflow_id],
        )?;
        for step in steps {
            insert_step(&tx, step)?;
        }
        tx.execute(
            "UPDATE workflows SET version = version + 1, updated_at = ?2 WHERE id = ?1",
            params![workflow_id, time::to_sql(&chrono::Utc::now())],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Delete a workflow; its steps go with it.
    pub fn delete_workflow(&self, id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute("DELETE FROM workflows WHERE id = ?1", params![id])?;
        Ok(())
    }
}

const WORKFLOW_SELECT: &str = "SELECT id, name, description, kind, owner_id, owner_role, status,
        version, pre_prompt, validated_by, rejection_reason, created_at, updated_at
 FROM workflows";

fn insert_step(tx: &rusqlite::Transaction<'_>, step: &WorkflowStep) -> Result<()> {
    tx.execute(
        "INSERT INTO workflow_steps
             (id, workflow_id, rank, name, kind, provider, model, prompt, system_prompt,
              config, criteria_list_id, timeout_ms, retry_max, fan_group)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            step.id,
            step.workflow_id,
            step.rank,
            step.name,
            step.kind.as_str(),
            step.provider,
            step.model,
            step.prompt,
            step.system_prompt,
            serde_json::to_string(&step.config)?,
            step.criteria_list_id,
            step.timeout_ms,
            step.retry_max,
            step.fan_group,
        ],
    )?;
    Ok(())
}

fn workflow_from_row(row: &Row<'_>) -> rusqlite::Result<Result<Workflow>> {
    let status: String = row.get(6)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;
    Ok((|| {
        Ok(Workflow {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            kind: row.get(3)?,
            owner_id: row.get(4)?,
            owner_role: row.get(5)?,
            status: WorkflowStatus::parse(&status)?,
            version: row.get(7)?,
            pre_prompt: row.get(8)?,
            validated_by: row.get(9)?,
            rejection_reason: row.get(10)?,
            created_at: time::parse(&created_at)?,
            updated_at: time::parse(&updated_at)?,
        })
    })())
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<Result<WorkflowStep>> {
    let kind: String = row.get(4)?;
    let config: String = row.get(9)?;
    Ok((|| {
        let config: HashMap<String, String> = serde_json::from_str(&config)?;
        Ok(WorkflowStep {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            rank: row.get(2)?,
            name: row.get(3)?,
            kind: StepKind::parse(&kind)?,
            provider: row.get(5)?,
            model: row.get(6)?,
            prompt: row.get(7)?,
            system_prompt: row.get(8)?,
            config,
            criteria_list_id: row.get(10)?,
            timeout_ms: row.get(11)?,
            retry_max: row.get(12)?,
            fan_group: row.get(13)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::new_id;
    use crate::test_support::{draft_workflow, llm_step};

    #[test]
    fn test_workflow_round_trip_with_steps() {
        let store = ForensicStore::open_in_memory().unwrap();
        let workflow = draft_workflow("sanity-check");
        let steps = vec![
            llm_step(&workflow.id, "decompose", 1),
            llm_step(&workflow.id, "attack", 2),
        ];
        store.insert_workflow(&workflow, &steps).unwrap();

        let loaded = store.get_workflow_by_name("sanity-check").unwrap();
        assert_eq!(loaded.id, workflow.id);
        assert_eq!(loaded.status, WorkflowStatus::Draft);

        let loaded_steps = store.list_steps(&workflow.id).unwrap();
        assert_eq!(loaded_steps.len(), 2);
        assert_eq!(loaded_steps[0].name, "decompose");
        assert_eq!(loaded_steps[1].rank, 2);
    }

    #[test]
    fn test_steps_ordered_by_rank() {
        let store = ForensicStore::open_in_memory().unwrap();
        let workflow = draft_workflow("ordering");
        let steps = vec![
            llm_step(&workflow.id, "last", 9),
            llm_step(&workflow.id, "first", 1),
            llm_step(&workflow.id, "middle", 5),
        ];
        store.insert_workflow(&workflow, &steps).unwrap();

        let ranks: Vec<i64> = store
            .list_steps(&workflow.id)
            .unwrap()
            .iter()
            .map(|s| s.rank)
            .collect();
        assert_eq!(ranks, vec![1, 5, 9]);
    }

    #[test]
    fn test_steps_immutable_after_activation() {
        let store = ForensicStore::open_in_memory().unwrap();
        let workflow = draft_workflow("frozen");
        let steps = vec![llm_step(&workflow.id, "only", 1)];
        store.insert_workflow(&workflow, &steps).unwrap();

        store
            .update_workflow_status(&workflow.id, WorkflowStatus::Active, Some("validator"), None)
            .unwrap();

        let replacement = vec![llm_step(&workflow.id, "sneaky", 1)];
        let err = store.replace_steps(&workflow.id, &replacement);
        assert!(matches!(err, Err(StoreError::InvalidValue { .. })));
    }

    #[test]
    fn test_delete_cascades_to_steps() {
        let store = ForensicStore::open_in_memory().unwrap();
        let workflow = draft_workflow("doomed");
        store
            .insert_workflow(&workflow, &[llm_step(&workflow.id, "s", 1)])
            .unwrap();

        store.delete_workflow(&workflow.id).unwrap();
        assert!(store.list_steps(&workflow.id).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_name_is_an_error() {
        let store = ForensicStore::open_in_memory().unwrap();
        let a = draft_workflow("same-name");
        store.insert_workflow(&a, &[]).unwrap();

        let mut b = draft_workflow("same-name");
        b.id = new_id();
        assert!(store.insert_workflow(&b, &[]).is_err());
    }
}
