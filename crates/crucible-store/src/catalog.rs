//! Model catalogue, grants, and operator groups.

use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::forensic::ForensicStore;
use crate::ids::new_id;
use crate::time;
use crate::types::{AvailableModel, GrantEffect, GranteeKind, ModelGrant, OperatorGroup};

impl ForensicStore {
    /// Upsert a catalogue entry keyed by `<provider>/<name>`. Discovery
    /// refreshes availability and metadata; ownership is set at creation
    /// and never mutated.
    pub fn upsert_model(&self, model: &AvailableModel) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO available_models
                 (id, provider, name, display_name, context_window, available,
                  last_checked_at, last_error, capabilities, discovered_at, owner_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                 display_name = excluded.display_name,
                 context_window = excluded.context_window,
                 available = excluded.available,
                 last_checked_at = excluded.last_checked_at,
                 last_error = excluded.last_error,
                 capabilities = excluded.capabilities",
            params![
                model.id,
                model.provider,
                model.name,
                model.display_name,
                model.context_window,
                model.available as i64,
                time::to_sql_opt(&model.last_checked_at),
                model.last_error,
                model.capabilities,
                time::to_sql(&model.discovered_at),
                model.owner_id,
            ],
        )?;
        Ok(())
    }

    /// Fetch a catalogue entry by `<provider>/<name>`.
    pub fn get_model(&self, id: &str) -> Result<Option<AvailableModel>> {
        let conn = self.conn();
        let model = conn
            .query_row(
                &format!("{MODEL_SELECT} WHERE id = ?1"),
                params![id],
                model_from_row,
            )
            .optional()?;
        model.transpose()
    }

    /// List the whole catalogue, provider first.
    pub fn list_models(&self) -> Result<Vec<AvailableModel>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{MODEL_SELECT} ORDER BY provider, name"))?;
        let rows = stmt.query_map([], model_from_row)?;
        let mut models = Vec::new();
        for row in rows {
            models.push(row??);
        }
        Ok(models)
    }

    /// Mark every entry of a provider unavailable after a provider-wide
    /// discovery failure. Returns the number of rows touched.
    pub fn mark_provider_unavailable(&self, provider: &str, error: &str) -> Result<usize> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE available_models
             SET available = 0, last_checked_at = ?2, last_error = ?3
             WHERE provider = ?1",
            params![provider, time::to_sql(&chrono::Utc::now()), error],
        )?;
        debug!(provider, changed, "marked provider models unavailable");
        Ok(changed)
    }

    /// Insert a grant. The `(grantee_kind, grantee_id, model, step_kind)`
    /// tuple is unique; duplicates are constraint errors.
    pub fn insert_grant(&self, grant: &ModelGrant) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO model_grants
                 (id, grantee_kind, grantee_id, model, step_kind, effect, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                grant.id,
                grant.grantee_kind.as_str(),
                grant.grantee_id,
                grant.model,
                grant.step_kind,
                grant.effect.as_str(),
                grant.created_by,
                time::to_sql(&grant.created_at),
            ],
        )?;
        Ok(())
    }

    /// Delete a grant by id. Grants are immutable except for deletion.
    pub fn delete_grant(&self, id: &str) -> Result<()> {
        let conn = self.conn();
        let changed = conn.execute("DELETE FROM model_grants WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                entity: "grant",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Load every grant row that could apply to this principal: the user's
    /// rows plus the role's rows. Priority ordering happens in the engine.
    pub fn list_grants_for(&self, user_id: &str, role: &str) -> Result<Vec<ModelGrant>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, grantee_kind, grantee_id, model, step_kind, effect, created_by, created_at
             FROM model_grants
             WHERE (grantee_kind = 'user' AND grantee_id = ?1)
                OR (grantee_kind = 'role' AND grantee_id = ?2)",
        )?;
        let rows = stmt.query_map(params![user_id, role], grant_from_row)?;
        let mut grants = Vec::new();
        for row in rows {
            grants.push(row??);
        }
        Ok(grants)
    }

    /// List every grant, for operator inspection.
    pub fn list_grants(&self) -> Result<Vec<ModelGrant>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, grantee_kind, grantee_id, model, step_kind, effect, created_by, created_at
             FROM model_grants ORDER BY grantee_kind, grantee_id, model",
        )?;
        let rows = stmt.query_map([], grant_from_row)?;
        let mut grants = Vec::new();
        for row in rows {
            grants.push(row??);
        }
        Ok(grants)
    }

    /// Bulk grant update inside one transaction: for every model, delete
    /// the `(user, id, model, '*')` rows of the revoked ids, then insert
    /// allow rows for the granted ids, ignoring duplicates.
    pub fn bulk_set_grants(
        &self,
        models: &[String],
        grant_ids: &[String],
        revoke_ids: &[String],
        creator: &str,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let now = time::to_sql(&chrono::Utc::now());

        for model in models {
            for revoke in revoke_ids {
                tx.execute(
                    "DELETE FROM model_grants
                     WHERE grantee_kind = 'user' AND grantee_id = ?1
                       AND model = ?2 AND step_kind = '*'",
                    params![revoke, model],
                )?;
            }
            for grantee in grant_ids {
                tx.execute(
                    "INSERT OR IGNORE INTO model_grants
                         (id, grantee_kind, grantee_id, model, step_kind, effect, created_by, created_at)
                     VALUES (?1, 'user', ?2, ?3, '*', 'allow', ?4, ?5)",
                    params![new_id(), grantee, model, creator, now],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Create an operator group.
    pub fn insert_group(&self, group: &OperatorGroup) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO operator_groups (id, provider, name, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                group.id,
                group.provider,
                group.name,
                time::to_sql(&group.created_at),
            ],
        )?;
        Ok(())
    }

    /// Add a member to a group; the pair is unique.
    pub fn add_group_member(&self, group_id: &str, operator_id: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO group_members (group_id, operator_id) VALUES (?1, ?2)",
            params![group_id, operator_id],
        )?;
        Ok(())
    }

    /// List the member ids of a group.
    pub fn list_group_members(&self, group_id: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT operator_id FROM group_members WHERE group_id = ?1 ORDER BY operator_id",
        )?;
        let rows = stmt.query_map(params![group_id], |row| row.get::<_, String>(0))?;
        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }
}

const MODEL_SELECT: &str = "SELECT id, provider, name, display_name, context_window, available,
        last_checked_at, last_error, capabilities, discovered_at, owner_id
 FROM available_models";

fn model_from_row(row: &Row<'_>) -> rusqlite::Result<Result<AvailableModel>> {
    let available: i64 = row.get(5)?;
    let last_checked_at: Option<String> = row.get(6)?;
    let discovered_at: String = row.get(9)?;
    Ok((|| {
        Ok(AvailableModel {
            id: row.get(0)?,
            provider: row.get(1)?,
            name: row.get(2)?,
            display_name: row.get(3)?,
            context_window: row.get(4)?,
            available: available != 0,
            last_checked_at: time::parse_opt(last_checked_at)?,
            last_error: row.get(7)?,
            capabilities: row.get(8)?,
            discovered_at: time::parse(&discovered_at)?,
            owner_id: row.get(10)?,
        })
    })())
}

fn grant_from_row(row: &Row<'_>) -> rusqlite::Result<Result<ModelGrant>> {
    let grantee_kind: String = row.get(1)?;
    let effect: String = row.get(5)?;
    let created_at: String = row.get(7)?;
    Ok((|| {
        Ok(ModelGrant {
            id: row.get(0)?,
            grantee_kind: GranteeKind::parse(&grantee_kind)?,
            grantee_id: row.get(2)?,
            model: row.get(3)?,
            step_kind: row.get(4)?,
            effect: GrantEffect::parse(&effect)?,
            created_by: row.get(6)?,
            created_at: time::parse(&created_at)?,
        })
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{catalogue_model, user_grant};

    #[test]
    fn test_upsert_model_is_idempotent() {
        let store = ForensicStore::open_in_memory().unwrap();
        let model = catalogue_model("vendor", "m1", true);

        store.upsert_model(&model).unwrap();
        store.upsert_model(&model).unwrap();

        let models = store.list_models().unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].id, "vendor/m1");
        assert!(models[0].available);
    }

    #[test]
    fn test_upsert_preserves_ownership() {
        let store = ForensicStore::open_in_memory().unwrap();
        let mut model = catalogue_model("vendor", "m1", true);
        model.owner_id = Some("operator7".into());
        store.upsert_model(&model).unwrap();

        // A later discovery sweep carries no owner; the original sticks.
        let mut rediscovered = catalogue_model("vendor", "m1", true);
        rediscovered.owner_id = None;
        store.upsert_model(&rediscovered).unwrap();

        let loaded = store.get_model("vendor/m1").unwrap().unwrap();
        assert_eq!(loaded.owner_id.as_deref(), Some("operator7"));
    }

    #[test]
    fn test_mark_provider_unavailable() {
        let store = ForensicStore::open_in_memory().unwrap();
        store
            .upsert_model(&catalogue_model("vendor", "m1", true))
            .unwrap();
        store
            .upsert_model(&catalogue_model("vendor", "m2", true))
            .unwrap();
        store
            .upsert_model(&catalogue_model("other", "m3", true))
            .unwrap();

        let changed = store
            .mark_provider_unavailable("vendor", "connection refused")
            .unwrap();
        assert_eq!(changed, 2);

        let m1 = store.get_model("vendor/m1").unwrap().unwrap();
        assert!(!m1.available);
        assert_eq!(m1.last_error.as_deref(), Some("connection refused"));
        assert!(m1.last_checked_at.is_some());

        let m3 = store.get_model("other/m3").unwrap().unwrap();
        assert!(m3.available);
    }

    #[test]
    fn test_grant_uniqueness() {
        let store = ForensicStore::open_in_memory().unwrap();
        let grant = user_grant("alice", "vendor/m1", "*", GrantEffect::Allow);
        store.insert_grant(&grant).unwrap();

        let mut duplicate = user_grant("alice", "vendor/m1", "*", GrantEffect::Deny);
        duplicate.id = new_id();
        assert!(store.insert_grant(&duplicate).is_err());
    }

    #[test]
    fn test_bulk_set_grants_is_idempotent() {
        let store = ForensicStore::open_in_memory().unwrap();
        let models = vec!["vendor/m1".to_string(), "vendor/m2".to_string()];
        let grantees = vec!["alice".to_string()];

        store
            .bulk_set_grants(&models, &grantees, &[], "admin")
            .unwrap();
        store
            .bulk_set_grants(&models, &grantees, &[], "admin")
            .unwrap();

        let grants = store.list_grants_for("alice", "member").unwrap();
        assert_eq!(grants.len(), 2);
        assert!(grants.iter().all(|g| g.effect == GrantEffect::Allow));
    }

    #[test]
    fn test_bulk_revoke_removes_wildcard_rows() {
        let store = ForensicStore::open_in_memory().unwrap();
        let models = vec!["vendor/m1".to_string()];
        store
            .bulk_set_grants(&models, &["alice".to_string()], &[], "admin")
            .unwrap();
        store
            .bulk_set_grants(&models, &[], &["alice".to_string()], "admin")
            .unwrap();

        assert!(store.list_grants_for("alice", "member").unwrap().is_empty());
    }

    #[test]
    fn test_group_membership_unique_pair() {
        let store = ForensicStore::open_in_memory().unwrap();
        let group = OperatorGroup {
            id: new_id(),
            provider: "vendor".into(),
            name: "vendor-operators".into(),
            created_at: chrono::Utc::now(),
        };
        store.insert_group(&group).unwrap();
        store.add_group_member(&group.id, "op1").unwrap();
        store.add_group_member(&group.id, "op1").unwrap();
        store.add_group_member(&group.id, "op2").unwrap();

        assert_eq!(
            store.list_group_members(&group.id).unwrap(),
            vec!["op1".to_string(), "op2".to_string()]
        );
    }
}
