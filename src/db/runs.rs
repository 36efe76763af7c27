use super::*;

impl SyncDb {
    // =========================================================================
    // Sync run audit trail
    // =========================================================================

    /// Record the outcome of one reconciliation run.
    pub fn record_sync_run(&self, run: &DbSyncRun) -> Result<(), DbError> {
        self.conn().execute(
            "INSERT INTO sync_runs (
                id, project_id, trigger_reason, window_start, window_end,
                started_at, finished_at, completed,
                pages_fetched, api_calls, fetched, inserted, updated,
                unchanged, skipped_untracked, persist_errors, failures
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                run.id,
                run.project_id,
                run.trigger_reason,
                run.window_start,
                run.window_end,
                run.started_at,
                run.finished_at,
                run.completed as i32,
                run.pages_fetched,
                run.api_calls,
                run.fetched,
                run.inserted,
                run.updated,
                run.unchanged,
                run.skipped_untracked,
                run.persist_errors,
                run.failures,
            ],
        )?;
        Ok(())
    }

    /// Most recent runs for a project, newest first.
    pub fn list_recent_runs(
        &self,
        project_id: &str,
        limit: u32,
    ) -> Result<Vec<DbSyncRun>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, project_id, trigger_reason, window_start, window_end,
                    started_at, finished_at, completed,
                    pages_fetched, api_calls, fetched, inserted, updated,
                    unchanged, skipped_untracked, persist_errors, failures
             FROM sync_runs
             WHERE project_id = ?1
             ORDER BY started_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![project_id, limit], |row| {
            Ok(DbSyncRun {
                id: row.get(0)?,
                project_id: row.get(1)?,
                trigger_reason: row.get(2)?,
                window_start: row.get(3)?,
                window_end: row.get(4)?,
                started_at: row.get(5)?,
                finished_at: row.get(6)?,
                completed: row.get::<_, i32>(7)? != 0,
                pages_fetched: row.get(8)?,
                api_calls: row.get(9)?,
                fetched: row.get(10)?,
                inserted: row.get(11)?,
                updated: row.get(12)?,
                unchanged: row.get(13)?,
                skipped_untracked: row.get(14)?,
                persist_errors: row.get(15)?,
                failures: row.get(16)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }
}
