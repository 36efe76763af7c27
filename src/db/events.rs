use chrono::DateTime;

use super::*;
use crate::types::EventStatus;

impl SyncDb {
    // =========================================================================
    // Booking events
    // =========================================================================

    /// Insert or update a booking event keyed by (project_id, external_id).
    ///
    /// Semantics:
    /// - absent → insert; `created_at` comes from the source creation
    ///   timestamp when present, else now, and never changes afterwards;
    ///   invitee fields are only written here.
    /// - present → update only when the status differs or the source's
    ///   update timestamp is newer than the stored one; otherwise no write.
    ///
    /// The insert path still carries an ON CONFLICT clause: two runs racing
    /// on the same new external ID both pass the existence check, and the
    /// conflict target (the composite primary key) is what guarantees a
    /// single row with the later write's status.
    pub fn upsert_event(&self, input: &EventUpsert<'_>) -> Result<EventSyncOutcome, DbError> {
        let existing = self.get_event(input.project_id, input.external_id)?;
        let now = Utc::now().to_rfc3339();

        match existing {
            None => {
                let created_at = input
                    .source_created_at
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_else(|| now.clone());
                self.conn().execute(
                    "INSERT INTO booking_events (
                        project_id, external_id, event_type_name, scheduled_at,
                        status, source_updated_at, invitee_name, invitee_email,
                        created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(project_id, external_id) DO UPDATE SET
                        scheduled_at = excluded.scheduled_at,
                        status = excluded.status,
                        source_updated_at = excluded.source_updated_at,
                        updated_at = excluded.updated_at",
                    params![
                        input.project_id,
                        input.external_id,
                        input.event_type_name,
                        input.scheduled_at.to_rfc3339(),
                        input.status.as_str(),
                        input.source_updated_at.map(|dt| dt.to_rfc3339()),
                        input.invitee_name,
                        input.invitee_email,
                        created_at,
                        now,
                    ],
                )?;
                Ok(EventSyncOutcome::Inserted)
            }
            Some(stored) => {
                if !event_needs_update(&stored, input) {
                    return Ok(EventSyncOutcome::Unchanged);
                }
                self.conn().execute(
                    "UPDATE booking_events
                     SET scheduled_at = ?1,
                         status = ?2,
                         source_updated_at = ?3,
                         updated_at = ?4
                     WHERE project_id = ?5 AND external_id = ?6",
                    params![
                        input.scheduled_at.to_rfc3339(),
                        input.status.as_str(),
                        input.source_updated_at.map(|dt| dt.to_rfc3339()),
                        now,
                        input.project_id,
                        input.external_id,
                    ],
                )?;
                Ok(EventSyncOutcome::Updated)
            }
        }
    }

    /// Look up a single event by its composite key.
    pub fn get_event(
        &self,
        project_id: &str,
        external_id: &str,
    ) -> Result<Option<DbBookingEvent>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT project_id, external_id, event_type_name, scheduled_at,
                    status, source_updated_at, invitee_name, invitee_email,
                    created_at, updated_at
             FROM booking_events
             WHERE project_id = ?1 AND external_id = ?2",
        )?;
        let mut rows = stmt.query_map(params![project_id, external_id], |row| {
            let status: String = row.get(4)?;
            Ok(DbBookingEvent {
                project_id: row.get(0)?,
                external_id: row.get(1)?,
                event_type_name: row.get(2)?,
                scheduled_at: row.get(3)?,
                status: EventStatus::parse_lossy(&status),
                source_updated_at: row.get(5)?,
                invitee_name: row.get(6)?,
                invitee_email: row.get(7)?,
                created_at: row.get(8)?,
                updated_at: row.get(9)?,
            })
        })?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// Which external IDs already exist for a project, out of `candidates`.
    ///
    /// Used by the reconciler to decide which records need an invitee
    /// lookup before insert, without one SELECT per candidate.
    pub fn existing_event_ids(
        &self,
        project_id: &str,
        candidates: &[String],
    ) -> Result<std::collections::HashSet<String>, DbError> {
        let mut found = std::collections::HashSet::new();
        // SQLite's default variable limit is 999; chunk to stay well under.
        for chunk in candidates.chunks(500) {
            let placeholders = (0..chunk.len())
                .map(|i| format!("?{}", i + 2))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT external_id FROM booking_events
                 WHERE project_id = ?1 AND external_id IN ({})",
                placeholders
            );
            let mut bindings: Vec<&dyn rusqlite::types::ToSql> = vec![&project_id];
            for id in chunk {
                bindings.push(id);
            }
            let conn = self.conn();
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(bindings), |row| {
                row.get::<_, String>(0)
            })?;
            for row in rows {
                found.insert(row?);
            }
        }
        Ok(found)
    }

    /// Number of reconciled events for a project.
    pub fn count_events(&self, project_id: &str) -> Result<usize, DbError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM booking_events WHERE project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

/// Change detection for the update path.
///
/// A record is written only when the source reports something newer: a
/// different status, or an update timestamp strictly after the stored one.
/// Unparseable stored timestamps count as stale so the row self-repairs.
fn event_needs_update(stored: &DbBookingEvent, input: &EventUpsert<'_>) -> bool {
    if stored.status != input.status {
        return true;
    }

    let Some(incoming) = input.source_updated_at else {
        return false;
    };

    match stored
        .source_updated_at
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    {
        Some(stored_at) => incoming > stored_at,
        None => true,
    }
}
