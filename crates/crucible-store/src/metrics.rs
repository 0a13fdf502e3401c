//! The metrics store. Writes are best-effort: under backpressure or disk
//! trouble a dropped metric is logged and forgotten, never propagated.

use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

use crate::error::Result;
use crate::schema;
use crate::time;

/// Handle to the metrics store.
#[derive(Clone)]
pub struct MetricsStore {
    conn: Arc<Mutex<Connection>>,
}

/// A step-level metric sample.
#[derive(Debug, Clone)]
pub struct StepMetric {
    pub run_id: String,
    pub step_name: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub latency_ms: i64,
}

/// A run-level metric sample.
#[derive(Debug, Clone)]
pub struct RunMetric {
    pub run_id: String,
    pub workflow_id: String,
    pub status: String,
    pub total_steps: i64,
    pub completed_steps: i64,
    pub duration_ms: i64,
}

impl MetricsStore {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::init(conn, path.as_ref().display().to_string())
    }

    /// Open a private in-memory store. Used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, "<memory>".to_string())
    }

    fn init(conn: Connection, label: String) -> Result<Self> {
        schema::configure(&conn)?;
        schema::migrate(&conn, schema::METRICS_SCHEMA, schema::METRICS_MIGRATIONS)?;
        info!(store = %label, "metrics store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a step metric, best effort.
    pub fn record_step(&self, metric: &StepMetric) {
        let conn = self.conn();
        let outcome = conn.execute(
            "INSERT INTO step_metrics
                 (run_id, step_name, provider, model, tokens_in, tokens_out, latency_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                metric.run_id,
                metric.step_name,
                metric.provider,
                metric.model,
                metric.tokens_in,
                metric.tokens_out,
                metric.latency_ms,
                time::to_sql(&chrono::Utc::now()),
            ],
        );
        if let Err(e) = outcome {
            warn!(run_id = %metric.run_id, step = %metric.step_name, "dropped step metric: {e}");
        }
    }

    /// Record a run metric, best effort.
    pub fn record_run(&self, metric: &RunMetric) {
        let conn = self.conn();
        let outcome = conn.execute(
            "INSERT INTO run_metrics
                 (run_id, workflow_id, status, total_steps, completed_steps, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                metric.run_id,
                metric.workflow_id,
                metric.status,
                metric.total_steps,
                metric.completed_steps,
                metric.duration_ms,
                time::to_sql(&chrono::Utc::now()),
            ],
        );
        if let Err(e) = outcome {
            warn!(run_id = %metric.run_id, "dropped run metric: {e}");
        }
    }

    /// Count recorded step metrics for a run. Used by tests and reports.
    pub fn step_metric_count(&self, run_id: &str) -> Result<i64> {
        let conn = self.conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM step_metrics WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
