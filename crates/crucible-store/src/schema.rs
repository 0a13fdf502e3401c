//! Schema definitions and migration helpers.
//!
//! Each store applies a base schema of `CREATE TABLE IF NOT EXISTS`
//! statements, then an ordered list of additive `ALTER TABLE` migrations
//! where "duplicate column" errors are ignored, then idempotent seed rows.
//! Opening a fresh store and re-opening an already-migrated one must yield
//! identical catalogues.

use rusqlite::Connection;
use tracing::debug;

use crate::error::{Result, StoreError};

pub const SCHEMA_VERSION: i64 = 3;

/// Base schema of the forensic store.
pub const FORENSIC_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflows (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    kind TEXT NOT NULL DEFAULT 'challenge',
    owner_id TEXT NOT NULL,
    owner_role TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'draft'
        CHECK (status IN ('draft','active','archived','rejected')),
    version INTEGER NOT NULL DEFAULT 1,
    pre_prompt TEXT,
    validated_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS criteria_lists (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    criteria TEXT NOT NULL DEFAULT '[]',
    owner_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_steps (
    id TEXT PRIMARY KEY,
    workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
    rank INTEGER NOT NULL,
    name TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('llm','check','sql','http')),
    provider TEXT,
    model TEXT,
    prompt TEXT,
    system_prompt TEXT,
    config TEXT NOT NULL DEFAULT '{}',
    criteria_list_id TEXT REFERENCES criteria_lists(id),
    timeout_ms INTEGER NOT NULL DEFAULT 120000,
    retry_max INTEGER NOT NULL DEFAULT 1,
    UNIQUE (workflow_id, name)
);

CREATE TABLE IF NOT EXISTS workflow_runs (
    id TEXT PRIMARY KEY,
    workflow_id TEXT NOT NULL REFERENCES workflows(id),
    node_id TEXT,
    user_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending','running','completed','failed','cancelled')),
    pre_prompt TEXT,
    total_steps INTEGER NOT NULL DEFAULT 0,
    completed_steps INTEGER NOT NULL DEFAULT 0,
    result TEXT,
    error TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS workflow_step_runs (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES workflow_runs(id) ON DELETE CASCADE,
    step_id TEXT NOT NULL REFERENCES workflow_steps(id),
    rank INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'running'
        CHECK (status IN ('running','completed','failed')),
    input TEXT,
    output TEXT,
    model_used TEXT,
    provider_used TEXT,
    tokens_in INTEGER NOT NULL DEFAULT 0,
    tokens_out INTEGER NOT NULL DEFAULT 0,
    latency_ms INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    started_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT,
    step_run_id TEXT,
    kind TEXT NOT NULL,
    payload TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_log_run ON audit_log(run_id);

CREATE TABLE IF NOT EXISTS available_models (
    id TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    name TEXT NOT NULL,
    display_name TEXT,
    context_window INTEGER,
    available INTEGER NOT NULL DEFAULT 1,
    last_checked_at TEXT,
    last_error TEXT,
    capabilities TEXT,
    discovered_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS model_grants (
    id TEXT PRIMARY KEY,
    grantee_kind TEXT NOT NULL CHECK (grantee_kind IN ('user','role')),
    grantee_id TEXT NOT NULL,
    model TEXT NOT NULL,
    step_kind TEXT NOT NULL DEFAULT '*',
    effect TEXT NOT NULL CHECK (effect IN ('allow','deny')),
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (grantee_kind, grantee_id, model, step_kind)
);

CREATE TABLE IF NOT EXISTS operator_groups (
    id TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (provider, name)
);

CREATE TABLE IF NOT EXISTS group_members (
    group_id TEXT NOT NULL REFERENCES operator_groups(id) ON DELETE CASCADE,
    operator_id TEXT NOT NULL,
    PRIMARY KEY (group_id, operator_id)
);

CREATE TABLE IF NOT EXISTS flow_steps (
    id TEXT PRIMARY KEY,
    flow_id TEXT NOT NULL,
    step_index INTEGER NOT NULL,
    node_id TEXT,
    model TEXT NOT NULL,
    provider TEXT NOT NULL,
    prompt TEXT NOT NULL,
    system_prompt TEXT NOT NULL DEFAULT '',
    response_raw TEXT NOT NULL DEFAULT '',
    response_parsed TEXT,
    tokens_in INTEGER NOT NULL DEFAULT 0,
    tokens_out INTEGER NOT NULL DEFAULT 0,
    latency_ms INTEGER NOT NULL DEFAULT 0,
    finish_reason TEXT,
    error TEXT,
    replay_of TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_flow_steps_flow ON flow_steps(flow_id);
";

/// Additive migrations for the forensic store, applied in order. Columns
/// that already exist are skipped.
pub const FORENSIC_MIGRATIONS: &[&str] = &[
    "ALTER TABLE workflows ADD COLUMN rejection_reason TEXT",
    "ALTER TABLE workflow_runs ADD COLUMN batch_id TEXT",
    "ALTER TABLE workflow_steps ADD COLUMN fan_group TEXT",
    "ALTER TABLE workflow_step_runs ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE available_models ADD COLUMN owner_id TEXT",
    "ALTER TABLE flow_steps ADD COLUMN dispatch_id TEXT",
];

/// Base schema of the tree store. The `node_type` CHECK here is the current
/// ontology; pre-migration stores carry the legacy one and are rebuilt by
/// `TreeStore::migrate_node_type_constraint`.
pub const TREE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    parent_id TEXT REFERENCES nodes(id),
    node_type TEXT NOT NULL
        CHECK (node_type IN ('claim','piece','challenge','resolution')),
    body TEXT NOT NULL,
    author_id TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS votes (
    id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL REFERENCES nodes(id),
    user_id TEXT NOT NULL,
    value INTEGER NOT NULL CHECK (value IN (-1, 1)),
    created_at TEXT NOT NULL,
    UNIQUE (node_id, user_id)
);
";

pub const TREE_MIGRATIONS: &[&str] = &["ALTER TABLE nodes ADD COLUMN visibility TEXT"];

/// Base schema of the metrics store.
pub const METRICS_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS step_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    step_name TEXT NOT NULL,
    provider TEXT,
    model TEXT,
    tokens_in INTEGER NOT NULL DEFAULT 0,
    tokens_out INTEGER NOT NULL DEFAULT 0,
    latency_ms INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS run_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    workflow_id TEXT NOT NULL,
    status TEXT NOT NULL,
    total_steps INTEGER NOT NULL DEFAULT 0,
    completed_steps INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
";

pub const METRICS_MIGRATIONS: &[&str] = &[];

/// Configure the connection the way every store expects: write-ahead
/// logging, foreign keys, and a 5-second busy timeout.
pub fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .map_err(|e| StoreError::Migration(format!("failed to configure pragmas: {e}")))?;
    Ok(())
}

/// Apply the base schema and the ordered additive migrations.
pub fn migrate(conn: &Connection, schema: &str, additive: &[&str]) -> Result<()> {
    conn.execute_batch(schema)
        .map_err(|e| StoreError::Migration(format!("failed to apply base schema: {e}")))?;

    for sql in additive {
        apply_additive(conn, sql)?;
    }

    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        rusqlite::params![SCHEMA_VERSION, now],
    )
    .map_err(|e| StoreError::Migration(format!("failed to record schema version: {e}")))?;

    Ok(())
}

/// Run one additive migration, ignoring "duplicate column" errors so that
/// repeated startup is safe.
fn apply_additive(conn: &Connection, sql: &str) -> Result<()> {
    match conn.execute_batch(sql) {
        Ok(()) => {
            debug!(sql, "applied additive migration");
            Ok(())
        }
        Err(e) if e.to_string().contains("duplicate column name") => Ok(()),
        Err(e) => Err(StoreError::Migration(format!("{sql}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_additive_migration_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id TEXT PRIMARY KEY)")
            .unwrap();

        apply_additive(&conn, "ALTER TABLE t ADD COLUMN extra TEXT").unwrap();
        // Second application hits the duplicate-column error and is ignored.
        apply_additive(&conn, "ALTER TABLE t ADD COLUMN extra TEXT").unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('t') WHERE name = 'extra'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_bad_migration_surfaces() {
        let conn = Connection::open_in_memory().unwrap();
        let err = apply_additive(&conn, "ALTER TABLE missing ADD COLUMN x TEXT");
        assert!(matches!(err, Err(StoreError::Migration(_))));
    }
}
