use super::*;

impl SyncDb {
    // =========================================================================
    // Projects
    // =========================================================================

    /// Helper: map a row to `DbProject`.
    pub(crate) fn map_project_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbProject> {
        Ok(DbProject {
            id: row.get(0)?,
            name: row.get(1)?,
            organization_uri: row.get(2)?,
            access_token: row.get(3)?,
            timezone: row
                .get::<_, Option<String>>(4)?
                .unwrap_or_else(|| "UTC".to_string()),
            sync_enabled: row.get::<_, i32>(5)? != 0,
            last_synced_at: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    const PROJECT_COLUMNS: &'static str = "id, name, organization_uri, access_token, timezone,
                    sync_enabled, last_synced_at, created_at, updated_at";

    /// Insert or update a project. The last-sync marker is owned by the
    /// reconciler and is never touched here.
    pub fn upsert_project(&self, project: &DbProject) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO projects (
                id, name, organization_uri, access_token, timezone,
                sync_enabled, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                organization_uri = excluded.organization_uri,
                access_token = COALESCE(excluded.access_token, projects.access_token),
                timezone = excluded.timezone,
                sync_enabled = excluded.sync_enabled,
                updated_at = excluded.updated_at",
            params![
                project.id,
                project.name,
                project.organization_uri,
                project.access_token,
                project.timezone,
                project.sync_enabled as i32,
                now,
            ],
        )?;
        Ok(())
    }

    /// Get a project by ID.
    pub fn get_project(&self, id: &str) -> Result<Option<DbProject>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM projects WHERE id = ?1",
            Self::PROJECT_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![id], Self::map_project_row)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// All projects, for the admin listing.
    pub fn list_projects(&self) -> Result<Vec<DbProject>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM projects ORDER BY name",
            Self::PROJECT_COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::map_project_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Projects eligible for a batch sync run.
    pub fn list_enabled_projects(&self) -> Result<Vec<DbProject>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM projects WHERE sync_enabled = 1 ORDER BY name",
            Self::PROJECT_COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::map_project_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Advance the per-project last-sync marker. Called at the end of every
    /// reconciliation run, including runs with zero changes.
    pub fn mark_project_synced(&self, id: &str, synced_at: &str) -> Result<(), DbError> {
        self.conn().execute(
            "UPDATE projects SET last_synced_at = ?1, updated_at = ?1 WHERE id = ?2",
            params![synced_at, id],
        )?;
        Ok(())
    }
}
