use super::*;

impl SyncDb {
    // =========================================================================
    // Event type mappings
    // =========================================================================

    /// Insert or refresh a type mapping discovered from the source.
    ///
    /// Idempotent: re-discovery renames and reactivates, and `created_at`
    /// survives. There is no deletion path — see
    /// `deactivate_missing_mappings`.
    pub fn ensure_mapping(
        &self,
        project_id: &str,
        external_type_id: &str,
        display_name: &str,
    ) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO event_type_mappings (
                project_id, external_type_id, display_name, is_active, created_at, updated_at
             ) VALUES (?1, ?2, ?3, 1, ?4, ?4)
             ON CONFLICT(project_id, external_type_id) DO UPDATE SET
                display_name = excluded.display_name,
                is_active = 1,
                updated_at = excluded.updated_at",
            params![project_id, external_type_id, display_name, now],
        )?;
        Ok(())
    }

    /// Active mappings for a project — the filter set for reconciliation.
    pub fn list_active_mappings(
        &self,
        project_id: &str,
    ) -> Result<Vec<DbEventTypeMapping>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT project_id, external_type_id, display_name, is_active,
                    created_at, updated_at
             FROM event_type_mappings
             WHERE project_id = ?1 AND is_active = 1
             ORDER BY display_name",
        )?;
        let rows = stmt.query_map(params![project_id], |row| {
            Ok(DbEventTypeMapping {
                project_id: row.get(0)?,
                external_type_id: row.get(1)?,
                display_name: row.get(2)?,
                is_active: row.get::<_, i32>(3)? != 0,
                created_at: row.get(4)?,
                updated_at: row.get(5)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Deactivate mappings that discovery no longer returns.
    ///
    /// Rows are kept (historical events reference their display names);
    /// only `is_active` flips. Returns the number of deactivated mappings.
    pub fn deactivate_missing_mappings(
        &self,
        project_id: &str,
        seen_type_ids: &[String],
    ) -> Result<usize, DbError> {
        let now = Utc::now().to_rfc3339();

        if seen_type_ids.is_empty() {
            let affected = self.conn().execute(
                "UPDATE event_type_mappings SET is_active = 0, updated_at = ?1
                 WHERE project_id = ?2 AND is_active = 1",
                params![now, project_id],
            )?;
            return Ok(affected);
        }

        let placeholders = (0..seen_type_ids.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE event_type_mappings SET is_active = 0, updated_at = ?1
             WHERE project_id = ?2 AND is_active = 1
               AND external_type_id NOT IN ({})",
            placeholders
        );

        let mut bindings: Vec<&dyn rusqlite::types::ToSql> = vec![&now, &project_id];
        for id in seen_type_ids {
            bindings.push(id);
        }

        let affected = self
            .conn()
            .execute(&sql, rusqlite::params_from_iter(bindings))?;
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_ensure_mapping_idempotent() {
        let db = test_db();
        db.ensure_mapping("p1", "etype-1", "Discovery Call").unwrap();
        db.ensure_mapping("p1", "etype-1", "Discovery Call").unwrap();

        let active = db.list_active_mappings("p1").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].display_name, "Discovery Call");
    }

    #[test]
    fn test_ensure_mapping_renames_and_reactivates() {
        let db = test_db();
        db.ensure_mapping("p1", "etype-1", "Discovery Call").unwrap();
        db.deactivate_missing_mappings("p1", &[]).unwrap();
        assert!(db.list_active_mappings("p1").unwrap().is_empty());

        db.ensure_mapping("p1", "etype-1", "Intro Call").unwrap();
        let active = db.list_active_mappings("p1").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].display_name, "Intro Call");
        assert!(active[0].is_active);
    }

    #[test]
    fn test_deactivate_missing_keeps_seen() {
        let db = test_db();
        db.ensure_mapping("p1", "etype-1", "Discovery Call").unwrap();
        db.ensure_mapping("p1", "etype-2", "Strategy Session").unwrap();
        db.ensure_mapping("p2", "etype-1", "Other Project").unwrap();

        let deactivated = db
            .deactivate_missing_mappings("p1", &["etype-1".to_string()])
            .unwrap();
        assert_eq!(deactivated, 1);

        let active = db.list_active_mappings("p1").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].external_type_id, "etype-1");

        // Other projects untouched.
        assert_eq!(db.list_active_mappings("p2").unwrap().len(), 1);
    }
}
