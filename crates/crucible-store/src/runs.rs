//! Run and step-run persistence, plus the forensic flow-step records.

use rusqlite::{params, OptionalExtension, Row};

use crate::error::{Result, StoreError};
use crate::forensic::ForensicStore;
use crate::time;
use crate::types::{
    FlowStep, RunStatus, RunView, StepKind, StepRunStatus, StepRunView, WorkflowRun,
    WorkflowStepRun,
};

/// Fields written when a step run completes successfully.
#[derive(Debug, Clone, Default)]
pub struct StepRunOutcome {
    pub output: String,
    pub model_used: Option<String>,
    pub provider_used: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub latency_ms: i64,
    pub attempts: i64,
}

impl ForensicStore {
    /// Insert a run in its initial state.
    pub fn create_run(&self, run: &WorkflowRun) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO workflow_runs
                 (id, workflow_id, node_id, user_id, status, pre_prompt, batch_id,
                  total_steps, completed_steps, result, error, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                run.id,
                run.workflow_id,
                run.node_id,
                run.user_id,
                run.status.as_str(),
                run.pre_prompt,
                run.batch_id,
                run.total_steps,
                run.completed_steps,
                run.result,
                run.error,
                time::to_sql(&run.started_at),
                time::to_sql_opt(&run.completed_at),
            ],
        )?;
        Ok(())
    }

    /// Move a pending run to `running`.
    pub fn mark_run_running(&self, id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE workflow_runs SET status = 'running' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Move a run to a terminal state, recording result or error.
    pub fn finish_run(
        &self,
        id: &str,
        status: RunStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE workflow_runs
             SET status = ?2, result = ?3, error = ?4, completed_at = ?5
             WHERE id = ?1",
            params![
                id,
                status.as_str(),
                result,
                error,
                time::to_sql(&chrono::Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Atomically bump the run's completed-step counter.
    pub fn increment_completed_steps(&self, run_id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE workflow_runs SET completed_steps = completed_steps + 1 WHERE id = ?1",
            params![run_id],
        )?;
        Ok(())
    }

    /// Fetch a run by id.
    pub fn get_run(&self, id: &str) -> Result<WorkflowRun> {
        let conn = self.conn();
        conn.query_row(
            "SELECT id, workflow_id, node_id, user_id, status, pre_prompt, batch_id,
                    total_steps, completed_steps, result, error, started_at, completed_at
             FROM workflow_runs WHERE id = ?1",
            params![id],
            run_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            entity: "run",
            id: id.to_string(),
        })?
    }

    /// Caller-facing run view joined with the workflow name.
    pub fn get_run_view(&self, id: &str) -> Result<RunView> {
        let conn = self.conn();
        conn.query_row(
            "SELECT r.id, r.workflow_id, w.name, r.status, r.total_steps, r.completed_steps,
                    r.result, r.error, r.started_at, r.completed_at
             FROM workflow_runs r JOIN workflows w ON w.id = r.workflow_id
             WHERE r.id = ?1",
            params![id],
            |row| {
                let status: String = row.get(3)?;
                let started_at: String = row.get(8)?;
                let completed_at: Option<String> = row.get(9)?;
                Ok((|| {
                    Ok(RunView {
                        id: row.get(0)?,
                        workflow_id: row.get(1)?,
                        workflow_name: row.get(2)?,
                        status: RunStatus::parse(&status)?,
                        total_steps: row.get(4)?,
                        completed_steps: row.get(5)?,
                        result: row.get(6)?,
                        error: row.get(7)?,
                        started_at: time::parse(&started_at)?,
                        completed_at: time::parse_opt(completed_at)?,
                    })
                })())
            },
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            entity: "run",
            id: id.to_string(),
        })?
    }

    /// Insert a step run in state `running`.
    pub fn insert_step_run(&self, step_run: &WorkflowStepRun) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO workflow_step_runs
                 (id, run_id, step_id, rank, status, input, output, model_used, provider_used,
                  tokens_in, tokens_out, latency_ms, error, attempts, started_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                step_run.id,
                step_run.run_id,
                step_run.step_id,
                step_run.rank,
                step_run.status.as_str(),
                step_run.input,
                step_run.output,
                step_run.model_used,
                step_run.provider_used,
                step_run.tokens_in,
                step_run.tokens_out,
                step_run.latency_ms,
                step_run.error,
                step_run.attempts,
                time::to_sql(&step_run.started_at),
                time::to_sql_opt(&step_run.completed_at),
            ],
        )?;
        Ok(())
    }

    /// Mark a step run completed with its output and usage.
    pub fn complete_step_run(&self, id: &str, outcome: &StepRunOutcome) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE workflow_step_runs
             SET status = 'completed', output = ?2, model_used = ?3, provider_used = ?4,
                 tokens_in = ?5, tokens_out = ?6, latency_ms = ?7, attempts = ?8,
                 completed_at = ?9
             WHERE id = ?1",
            params![
                id,
                outcome.output,
                outcome.model_used,
                outcome.provider_used,
                outcome.tokens_in,
                outcome.tokens_out,
                outcome.latency_ms,
                outcome.attempts,
                time::to_sql(&chrono::Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Mark a step run failed with the final error, the latency of the last
    /// attempt, and the attempt count.
    pub fn fail_step_run(
        &self,
        id: &str,
        error: &str,
        latency_ms: i64,
        attempts: i64,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE workflow_step_runs
             SET status = 'failed', error = ?2, latency_ms = ?3, attempts = ?4, completed_at = ?5
             WHERE id = ?1",
            params![
                id,
                error,
                latency_ms,
                attempts,
                time::to_sql(&chrono::Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// List a run's step runs in rank order.
    pub fn list_step_runs(&self, run_id: &str) -> Result<Vec<WorkflowStepRun>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, step_id, rank, status, input, output, model_used, provider_used,
                    tokens_in, tokens_out, latency_ms, error, attempts, started_at, completed_at
             FROM workflow_step_runs WHERE run_id = ?1 ORDER BY rank, started_at",
        )?;
        let rows = stmt.query_map(params![run_id], step_run_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Caller-facing step-run views joined with step definitions.
    pub fn list_step_run_views(&self, run_id: &str) -> Result<Vec<StepRunView>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT sr.id, s.name, s.kind, sr.status, sr.input, sr.output, sr.model_used,
                    sr.provider_used, sr.tokens_in, sr.tokens_out, sr.latency_ms, sr.attempts,
                    sr.error, sr.started_at, sr.completed_at
             FROM workflow_step_runs sr JOIN workflow_steps s ON s.id = sr.step_id
             WHERE sr.run_id = ?1 ORDER BY sr.rank, sr.started_at",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            let kind: String = row.get(2)?;
            let status: String = row.get(3)?;
            let started_at: String = row.get(13)?;
            let completed_at: Option<String> = row.get(14)?;
            Ok((|| -> Result<StepRunView> {
                Ok(StepRunView {
                    id: row.get(0)?,
                    step_name: row.get(1)?,
                    kind: StepKind::parse(&kind)?,
                    status: StepRunStatus::parse(&status)?,
                    input: row.get(4)?,
                    output: row.get(5)?,
                    model_used: row.get(6)?,
                    provider_used: row.get(7)?,
                    tokens_in: row.get(8)?,
                    tokens_out: row.get(9)?,
                    latency_ms: row.get(10)?,
                    attempts: row.get(11)?,
                    error: row.get(12)?,
                    started_at: time::parse(&started_at)?,
                    completed_at: time::parse_opt(completed_at)?,
                })
            })())
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Count a run's step runs in state `completed`. Equals the run's
    /// `completed_steps` for terminal runs.
    pub fn count_completed_step_runs(&self, run_id: &str) -> Result<i64> {
        let conn = self.conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM workflow_step_runs WHERE run_id = ?1 AND status = 'completed'",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Persist a forensic flow-step record for one LLM exchange.
    pub fn insert_flow_step(&self, record: &FlowStep) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO flow_steps
                 (id, flow_id, step_index, node_id, model, provider, prompt, system_prompt,
                  response_raw, response_parsed, tokens_in, tokens_out, latency_ms,
                  finish_reason, error, replay_of, dispatch_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                record.id,
                record.flow_id,
                record.step_index,
                record.node_id,
                record.model,
                record.provider,
                record.prompt,
                record.system_prompt,
                record.response_raw,
                record.response_parsed,
                record.tokens_in,
                record.tokens_out,
                record.latency_ms,
                record.finish_reason,
                record.error,
                record.replay_of,
                record.dispatch_id,
                time::to_sql(&record.created_at),
            ],
        )?;
        Ok(())
    }

    /// List the forensic records of a flow in step order.
    pub fn list_flow_steps(&self, flow_id: &str) -> Result<Vec<FlowStep>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, flow_id, step_index, node_id, model, provider, prompt, system_prompt,
                    response_raw, response_parsed, tokens_in, tokens_out, latency_ms,
                    finish_reason, error, replay_of, dispatch_id, created_at
             FROM flow_steps WHERE flow_id = ?1 ORDER BY step_index",
        )?;
        let rows = stmt.query_map(params![flow_id], |row| {
            let created_at: String = row.get(17)?;
            Ok((|| -> Result<FlowStep> {
                Ok(FlowStep {
                    id: row.get(0)?,
                    flow_id: row.get(1)?,
                    step_index: row.get(2)?,
                    node_id: row.get(3)?,
                    model: row.get(4)?,
                    provider: row.get(5)?,
                    prompt: row.get(6)?,
                    system_prompt: row.get(7)?,
                    response_raw: row.get(8)?,
                    response_parsed: row.get(9)?,
                    tokens_in: row.get(10)?,
                    tokens_out: row.get(11)?,
                    latency_ms: row.get(12)?,
                    finish_reason: row.get(13)?,
                    error: row.get(14)?,
                    replay_of: row.get(15)?,
                    dispatch_id: row.get(16)?,
                    created_at: time::parse(&created_at)?,
                })
            })())
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<Result<WorkflowRun>> {
    let status: String = row.get(4)?;
    let started_at: String = row.get(11)?;
    let completed_at: Option<String> = row.get(12)?;
    Ok((|| {
        Ok(WorkflowRun {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            node_id: row.get(2)?,
            user_id: row.get(3)?,
            status: RunStatus::parse(&status)?,
            pre_prompt: row.get(5)?,
            batch_id: row.get(6)?,
            total_steps: row.get(7)?,
            completed_steps: row.get(8)?,
            result: row.get(9)?,
            error: row.get(10)?,
            started_at: time::parse(&started_at)?,
            completed_at: time::parse_opt(completed_at)?,
        })
    })())
}

fn step_run_from_row(row: &Row<'_>) -> rusqlite::Result<Result<WorkflowStepRun>> {
    let status: String = row.get(4)?;
    let started_at: String = row.get(14)?;
    let completed_at: Option<String> = row.get(15)?;
    Ok((|| {
        Ok(WorkflowStepRun {
            id: row.get(0)?,
            run_id: row.get(1)?,
            step_id: row.get(2)?,
            rank: row.get(3)?,
            status: StepRunStatus::parse(&status)?,
            input: row.get(5)?,
            output: row.get(6)?,
            model_used: row.get(7)?,
            provider_used: row.get(8)?,
            tokens_in: row.get(9)?,
            tokens_out: row.get(10)?,
            latency_ms: row.get(11)?,
            error: row.get(12)?,
            attempts: row.get(13)?,
            started_at: time::parse(&started_at)?,
            completed_at: time::parse_opt(completed_at)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{draft_workflow, llm_step, pending_run, running_step_run};

    #[test]
    fn test_run_lifecycle() {
        let store = ForensicStore::open_in_memory().unwrap();
        let workflow = draft_workflow("lifecycle");
        let step = llm_step(&workflow.id, "s1", 1);
        store.insert_workflow(&workflow, &[step.clone()]).unwrap();

        let run = pending_run(&workflow.id, 1);
        store.create_run(&run).unwrap();
        store.mark_run_running(&run.id).unwrap();

        let step_run = running_step_run(&run.id, &step.id, 1);
        store.insert_step_run(&step_run).unwrap();
        store
            .complete_step_run(
                &step_run.id,
                &StepRunOutcome {
                    output: "verdict".into(),
                    model_used: Some("vendor/m1".into()),
                    provider_used: Some("vendor".into()),
                    tokens_in: 10,
                    tokens_out: 20,
                    latency_ms: 150,
                    attempts: 1,
                },
            )
            .unwrap();
        store.increment_completed_steps(&run.id).unwrap();
        store
            .finish_run(&run.id, RunStatus::Completed, Some(r#"{"s1":"verdict"}"#), None)
            .unwrap();

        let loaded = store.get_run(&run.id).unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.completed_steps, 1);
        assert_eq!(
            loaded.completed_steps,
            store.count_completed_step_runs(&run.id).unwrap()
        );
        assert!(loaded.completed_at.is_some());

        let views = store.list_step_run_views(&run.id).unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].step_name, "s1");
        assert_eq!(views[0].status, StepRunStatus::Completed);
        assert_eq!(views[0].output.as_deref(), Some("verdict"));
        assert!(views[0].completed_at.is_some());
    }

    #[test]
    fn test_failed_step_run_records_error() {
        let store = ForensicStore::open_in_memory().unwrap();
        let workflow = draft_workflow("failure");
        let step = llm_step(&workflow.id, "s1", 1);
        store.insert_workflow(&workflow, &[step.clone()]).unwrap();
        let run = pending_run(&workflow.id, 1);
        store.create_run(&run).unwrap();

        let step_run = running_step_run(&run.id, &step.id, 1);
        store.insert_step_run(&step_run).unwrap();
        store
            .fail_step_run(&step_run.id, "provider melted", 90, 3)
            .unwrap();

        let runs = store.list_step_runs(&run.id).unwrap();
        assert_eq!(runs[0].status, StepRunStatus::Failed);
        assert_eq!(runs[0].error.as_deref(), Some("provider melted"));
        assert_eq!(runs[0].attempts, 3);
        assert_eq!(store.count_completed_step_runs(&run.id).unwrap(), 0);
    }

    #[test]
    fn test_run_view_joins_workflow_name() {
        let store = ForensicStore::open_in_memory().unwrap();
        let workflow = draft_workflow("joined-name");
        store.insert_workflow(&workflow, &[]).unwrap();
        let run = pending_run(&workflow.id, 0);
        store.create_run(&run).unwrap();

        let view = store.get_run_view(&run.id).unwrap();
        assert_eq!(view.workflow_name, "joined-name");
        assert_eq!(view.status, RunStatus::Pending);
    }

    #[test]
    fn test_flow_step_round_trip() {
        let store = ForensicStore::open_in_memory().unwrap();
        let record = FlowStep {
            id: crate::ids::new_id(),
            flow_id: "flow1".into(),
            step_index: 0,
            node_id: None,
            model: "vendor/m1".into(),
            provider: "vendor".into(),
            prompt: "Attack this claim.".into(),
            system_prompt: String::new(),
            response_raw: "{\"content\":\"done\"}".into(),
            response_parsed: Some("done".into()),
            tokens_in: 5,
            tokens_out: 7,
            latency_ms: 42,
            finish_reason: Some("stop".into()),
            error: None,
            replay_of: None,
            dispatch_id: Some("sr1".into()),
            created_at: chrono::Utc::now(),
        };
        store.insert_flow_step(&record).unwrap();

        let records = store.list_flow_steps("flow1").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].provider, "vendor");
        assert_eq!(records[0].response_parsed.as_deref(), Some("done"));
    }
}
