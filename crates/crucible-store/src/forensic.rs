//! The forensic store: workflows, runs, step runs, audit trail, model
//! catalogue, grants, operator groups, criteria lists, and the flow-step
//! records that make every LLM exchange replayable.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

use crate::error::Result;
use crate::schema;
use crate::time;
use crate::types::{AuditEvent, AuditKind, CriteriaList};

/// Handle to the forensic store. Cloning is cheap; all clones share one
/// connection serialized behind a mutex, with SQLite's busy timeout
/// covering cross-process writers.
#[derive(Clone)]
pub struct ForensicStore {
    conn: Arc<Mutex<Connection>>,
}

impl ForensicStore {
    /// Open or create the store at `path` and bring the schema up to date.
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
        schema::migrate(&conn, schema::FORENSIC_SCHEMA, schema::FORENSIC_MIGRATIONS)?;
        seed(&conn)?;
        info!(store = %label, "forensic store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned mutex only means another thread panicked mid-write;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an audit event. Events are observable in causal order per run
    /// via the monotonic rowid.
    pub fn record_audit(
        &self,
        run_id: Option<&str>,
        step_run_id: Option<&str>,
        kind: AuditKind,
        payload: Option<&JsonValue>,
    ) -> Result<i64> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (run_id, step_run_id, kind, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                run_id,
                step_run_id,
                kind.as_str(),
                payload.map(|p| p.to_string()),
                time::to_sql(&chrono::Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// List a run's audit events in insert order.
    pub fn list_audit(&self, run_id: &str) -> Result<Vec<AuditEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, run_id, step_run_id, kind, payload, created_at
             FROM audit_log WHERE run_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, run_id, step_run_id, kind, payload, created_at) = row?;
            events.push(AuditEvent {
                id,
                run_id,
                step_run_id,
                kind,
                payload,
                created_at: time::parse(&created_at)?,
            });
        }
        Ok(events)
    }

    /// Count audit events of one kind across all runs.
    pub fn count_audit(&self, kind: AuditKind) -> Result<i64> {
        let conn = self.conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM audit_log WHERE kind = ?1",
            params![kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Execute a read-only query on behalf of a `sql` step and serialize
    /// each row as a column-name → value mapping.
    pub fn query_select(&self, sql: &str) -> Result<Vec<serde_json::Map<String, JsonValue>>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut out = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut object = serde_json::Map::new();
            for (i, name) in columns.iter().enumerate() {
                object.insert(name.clone(), column_to_json(row.get_ref(i)?));
            }
            out.push(object);
        }
        Ok(out)
    }

    /// Insert a criteria list.
    pub fn insert_criteria_list(&self, list: &CriteriaList) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO criteria_lists (id, name, description, criteria, owner_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                list.id,
                list.name,
                list.description,
                serde_json::to_string(&list.criteria)?,
                list.owner_id,
                time::to_sql(&list.created_at),
                time::to_sql(&list.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Fetch a criteria list by id.
    pub fn get_criteria_list(&self, id: &str) -> Result<Option<CriteriaList>> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT id, name, description, criteria, owner_id, created_at, updated_at
                 FROM criteria_lists WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((id, name, description, criteria, owner_id, created_at, updated_at)) => {
                Ok(Some(CriteriaList {
                    id,
                    name,
                    description,
                    criteria: serde_json::from_str(&criteria)?,
                    owner_id,
                    created_at: time::parse(&created_at)?,
                    updated_at: time::parse(&updated_at)?,
                }))
            }
        }
    }
}

fn seed(conn: &Connection) -> Result<()> {
    let now = time::to_sql(&chrono::Utc::now());
    let criteria = serde_json::to_string(&[
        "The argument states its central claim explicitly.",
        "Every factual assertion is either sourced or marked as conjecture.",
        "The conclusion follows from the stated premises.",
    ])?;
    conn.execute(
        "INSERT OR IGNORE INTO criteria_lists
             (id, name, description, criteria, owner_id, created_at, updated_at)
         VALUES ('seedbaseline', 'baseline-rigor', 'Default rigor checklist applied to new claims.',
                 ?1, 'system', ?2, ?2)",
        params![criteria, now],
    )?;
    Ok(())
}

fn column_to_json(value: rusqlite::types::ValueRef<'_>) -> JsonValue {
    use rusqlite::types::ValueRef;
    match value {
        ValueRef::Null => JsonValue::Null,
        ValueRef::Integer(i) => JsonValue::from(i),
        ValueRef::Real(f) => JsonValue::from(f),
        ValueRef::Text(t) => JsonValue::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => JsonValue::String(String::from_utf8_lossy(b).into_owned()),
    }
}
