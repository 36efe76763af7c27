//! Shared type definitions for the database layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::EventStatus;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),
}

/// A row from the `projects` table. One row per client integration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbProject {
    pub id: String,
    pub name: String,
    /// Organization scope for the source's list endpoints.
    pub organization_uri: String,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    /// IANA timezone used for window day-boundary resolution.
    pub timezone: String,
    pub sync_enabled: bool,
    pub last_synced_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// A row from `event_type_mappings`: external category → display name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbEventTypeMapping {
    pub project_id: String,
    pub external_type_id: String,
    pub display_name: String,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// A row from `booking_events`, keyed by (project_id, external_id).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbBookingEvent {
    pub project_id: String,
    pub external_id: String,
    pub event_type_name: String,
    pub scheduled_at: String,
    pub status: EventStatus,
    pub source_updated_at: Option<String>,
    pub invitee_name: Option<String>,
    pub invitee_email: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Input to `upsert_event`. Timestamps are typed here; the row boundary
/// converts to RFC 3339 text.
#[derive(Debug, Clone)]
pub struct EventUpsert<'a> {
    pub project_id: &'a str,
    pub external_id: &'a str,
    pub event_type_name: &'a str,
    pub scheduled_at: DateTime<Utc>,
    pub status: EventStatus,
    /// Source creation timestamp; becomes `created_at` on first insert.
    pub source_created_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
    /// Only written on first insert.
    pub invitee_name: Option<&'a str>,
    pub invitee_email: Option<&'a str>,
}

/// What an upsert actually did, for run accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSyncOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// A row from `sync_runs` (audit trail).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSyncRun {
    pub id: String,
    pub project_id: String,
    pub trigger_reason: String,
    pub window_start: String,
    pub window_end: String,
    pub started_at: String,
    pub finished_at: String,
    pub completed: bool,
    pub pages_fetched: u32,
    pub api_calls: u32,
    pub fetched: u32,
    pub inserted: u32,
    pub updated: u32,
    pub unchanged: u32,
    pub skipped_untracked: u32,
    pub persist_errors: u32,
    /// JSON array of { stage, message } entries.
    pub failures: Option<String>,
}
