//! The tree store: proof-tree nodes and votes.
//!
//! The engine only reads node bodies; node/vote CRUD belongs to outer
//! layers. What lives here are the persistence contracts: visibility
//! coalescing for pre-migration rows, the busy-retry discipline on vote
//! writes, and the node-type constraint rebuild.

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{is_busy, Result, StoreError};
use crate::schema;
use crate::time;
use crate::types::{TreeNode, Vote};

const VOTE_RETRY_ATTEMPTS: u32 = 5;
const VOTE_RETRY_STEP_MS: u64 = 10;

/// Handle to the tree store. Cloning shares one connection.
#[derive(Clone)]
pub struct TreeStore {
    conn: Arc<Mutex<Connection>>,
}

impl TreeStore {
    /// Open or create the store at `path`, migrate, and rebuild the
    /// node-type constraint when a legacy ontology is detected.
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
        schema::migrate(&conn, schema::TREE_SCHEMA, schema::TREE_MIGRATIONS)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate_node_type_constraint()?;
        info!(store = %label, "tree store ready");
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rebuild `nodes` when its CHECK constraint predates the current
    /// ontology: copy into a replacement table with the value mapping,
    /// drop the legacy table, and swap the replacement into place, all
    /// under `foreign_keys = OFF` and a transaction. A failure rolls back
    /// and leaves the legacy table untouched.
    ///
    /// The replacement is created first and renamed last so that other
    /// tables' references to `nodes` are never rewritten by the rename.
    pub fn migrate_node_type_constraint(&self) -> Result<()> {
        let mut conn = self.conn();

        let table_sql: Option<String> = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'nodes'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(table_sql) = table_sql else {
            return Ok(());
        };
        if table_sql.contains("'piece'") {
            return Ok(());
        }

        info!("rebuilding nodes table for the current node-type ontology");
        conn.execute_batch("PRAGMA foreign_keys = OFF;")
            .map_err(|e| StoreError::Migration(format!("failed to disable foreign keys: {e}")))?;

        let outcome = (|| -> Result<()> {
            let tx = conn.transaction()?;
            tx.execute_batch(
                "CREATE TABLE nodes_next (
                     id TEXT PRIMARY KEY,
                     parent_id TEXT REFERENCES nodes(id),
                     node_type TEXT NOT NULL
                         CHECK (node_type IN ('claim','piece','challenge','resolution')),
                     body TEXT NOT NULL,
                     author_id TEXT NOT NULL DEFAULT '',
                     visibility TEXT,
                     created_at TEXT NOT NULL
                 );

                 INSERT INTO nodes_next (id, parent_id, node_type, body, author_id, visibility, created_at)
                 SELECT id, parent_id,
                        CASE node_type
                            WHEN 'claim' THEN 'claim'
                            WHEN 'counter' THEN 'challenge'
                            ELSE 'piece'
                        END,
                        body, author_id, visibility, created_at
                 FROM nodes;

                 DROP TABLE nodes;
                 ALTER TABLE nodes_next RENAME TO nodes;",
            )?;
            tx.commit()?;
            Ok(())
        })();

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| StoreError::Migration(format!("failed to re-enable foreign keys: {e}")))?;

        outcome.map_err(|e| StoreError::Migration(format!("node-type rebuild failed: {e}")))
    }

    /// Insert a node.
    pub fn insert_node(&self, node: &TreeNode) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO nodes (id, parent_id, node_type, body, author_id, visibility, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                node.id,
                node.parent_id,
                node.node_type,
                node.body,
                node.author_id,
                node.visibility,
                time::to_sql(&node.created_at),
            ],
        )?;
        Ok(())
    }

    /// Fetch a node. Pre-migration rows have NULL visibility; every read
    /// coalesces it to 'public'.
    pub fn get_node(&self, id: &str) -> Result<Option<TreeNode>> {
        let conn = self.conn();
        let node = conn
            .query_row(
                "SELECT id, parent_id, node_type, body, author_id,
                        COALESCE(visibility, 'public'), created_at
                 FROM nodes WHERE id = ?1",
                params![id],
                node_from_row,
            )
            .optional()?;
        node.transpose()
    }

    /// List the direct children of a node.
    pub fn list_children(&self, parent_id: &str) -> Result<Vec<TreeNode>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, parent_id, node_type, body, author_id,
                    COALESCE(visibility, 'public'), created_at
             FROM nodes WHERE parent_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map(params![parent_id], node_from_row)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row??);
        }
        Ok(nodes)
    }

    /// Insert a vote, retrying the transient busy class up to 5 attempts
    /// with linear backoff. Constraint violations surface immediately.
    pub fn insert_vote(&self, vote: &Vote) -> Result<()> {
        let mut last_busy: Option<rusqlite::Error> = None;

        for attempt in 1..=VOTE_RETRY_ATTEMPTS {
            let outcome = {
                let conn = self.conn();
                conn.execute(
                    "INSERT INTO votes (id, node_id, user_id, value, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        vote.id,
                        vote.node_id,
                        vote.user_id,
                        vote.value,
                        time::to_sql(&vote.created_at),
                    ],
                )
            };

            match outcome {
                Ok(_) => return Ok(()),
                Err(e) if is_busy(&e) => {
                    warn!(attempt, "vote insert hit busy database, backing off");
                    last_busy = Some(e);
                    std::thread::sleep(Duration::from_millis(VOTE_RETRY_STEP_MS * attempt as u64));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Busy {
            attempts: VOTE_RETRY_ATTEMPTS,
            source: last_busy.unwrap_or(rusqlite::Error::ExecuteReturnedResults),
        })
    }

    /// Sum of vote values for a node.
    pub fn vote_total(&self, node_id: &str) -> Result<i64> {
        let conn = self.conn();
        let total = conn.query_row(
            "SELECT COALESCE(SUM(value), 0) FROM votes WHERE node_id = ?1",
            params![node_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }
}

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Result<TreeNode>> {
    let created_at: String = row.get(6)?;
    Ok((|| {
        Ok(TreeNode {
            id: row.get(0)?,
            parent_id: row.get(1)?,
            node_type: row.get(2)?,
            body: row.get(3)?,
            author_id: row.get(4)?,
            visibility: row.get(5)?,
            created_at: time::parse(&created_at)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::new_id;

    fn claim(body: &str) -> TreeNode {
        TreeNode {
            id: new_id(),
            parent_id: None,
            node_type: "claim".into(),
            body: body.into(),
            author_id: "alice".into(),
            visibility: "public".into(),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_node_round_trip() {
        let store = TreeStore::open_in_memory().unwrap();
        let node = claim("Water boils at 100C at sea level.");
        store.insert_node(&node).unwrap();

        let loaded = store.get_node(&node.id).unwrap().unwrap();
        assert_eq!(loaded.body, node.body);
        assert_eq!(loaded.visibility, "public");

        let mut child = claim("Sea level matters because of pressure.");
        child.node_type = "piece".into();
        child.parent_id = Some(node.id.clone());
        store.insert_node(&child).unwrap();

        let children = store.list_children(&node.id).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, child.id);
    }

    #[test]
    fn test_visibility_coalesces_for_legacy_rows() {
        let store = TreeStore::open_in_memory().unwrap();
        let node = claim("legacy row");
        {
            let conn = store.conn();
            conn.execute(
                "INSERT INTO nodes (id, parent_id, node_type, body, author_id, visibility, created_at)
                 VALUES (?1, NULL, 'claim', ?2, 'alice', NULL, ?3)",
                params![node.id, node.body, time::to_sql(&node.created_at)],
            )
            .unwrap();
        }

        let loaded = store.get_node(&node.id).unwrap().unwrap();
        assert_eq!(loaded.visibility, "public");
    }

    #[test]
    fn test_vote_unique_per_user() {
        let store = TreeStore::open_in_memory().unwrap();
        let node = claim("voted on");
        store.insert_node(&node).unwrap();

        let vote = Vote {
            id: new_id(),
            node_id: node.id.clone(),
            user_id: "bob".into(),
            value: 1,
            created_at: chrono::Utc::now(),
        };
        store.insert_vote(&vote).unwrap();

        let mut again = vote.clone();
        again.id = new_id();
        // Constraint violation is not retried and surfaces immediately.
        assert!(matches!(
            store.insert_vote(&again),
            Err(StoreError::Database(_))
        ));
        assert_eq!(store.vote_total(&node.id).unwrap(), 1);
    }

    #[test]
    fn test_node_type_rebuild_maps_legacy_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tree.db");

        // Build a legacy store by hand: old ontology, no visibility column.
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE nodes (
                     id TEXT PRIMARY KEY,
                     parent_id TEXT REFERENCES nodes(id),
                     node_type TEXT NOT NULL CHECK (node_type IN ('claim','counter','evidence')),
                     body TEXT NOT NULL,
                     author_id TEXT NOT NULL DEFAULT '',
                     created_at TEXT NOT NULL
                 );
                 INSERT INTO nodes VALUES ('n1', NULL, 'claim', 'root', 'a', '2024-01-01T00:00:00Z');
                 INSERT INTO nodes VALUES ('n2', 'n1', 'counter', 'rebuttal', 'b', '2024-01-02T00:00:00Z');
                 INSERT INTO nodes VALUES ('n3', 'n1', 'evidence', 'data', 'c', '2024-01-03T00:00:00Z');",
            )
            .unwrap();
        }

        let store = TreeStore::open(&path).unwrap();
        assert_eq!(store.get_node("n1").unwrap().unwrap().node_type, "claim");
        assert_eq!(
            store.get_node("n2").unwrap().unwrap().node_type,
            "challenge"
        );
        assert_eq!(store.get_node("n3").unwrap().unwrap().node_type, "piece");

        // New ontology values insert cleanly after the rebuild.
        let mut node = claim("fresh");
        node.node_type = "piece".into();
        node.parent_id = Some("n1".into());
        store.insert_node(&node).unwrap();
    }

    #[test]
    fn test_node_type_rebuild_is_idempotent() {
        let store = TreeStore::open_in_memory().unwrap();
        store.migrate_node_type_constraint().unwrap();
        store.migrate_node_type_constraint().unwrap();
    }
}
