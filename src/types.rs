//! Shared types for sync triggers, windows, and run reports.
//!
//! Every trigger surface (HTTP, scheduler, CLI) speaks `SyncRequest` /
//! `SyncResponse`; the reconciler returns one `ProjectSyncReport` per
//! project and the caller folds them — there are no shared counters.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Canonical booking-event status.
///
/// The source API reports status as free text and is not consistent about
/// spelling across endpoints ("canceled" vs "cancelled", "no_show" vs
/// "noshow"). Everything is normalized to this enum at the API boundary;
/// only canonical values reach the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Active,
    Completed,
    Cancelled,
    NoShow,
}

impl EventStatus {
    /// Canonical string form, used for DB storage and query filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Active => "active",
            EventStatus::Completed => "completed",
            EventStatus::Cancelled => "cancelled",
            EventStatus::NoShow => "no_show",
        }
    }

    /// The spelling the source API expects in its `status` query parameter.
    pub fn query_value(&self) -> &'static str {
        match self {
            // The source spells cancellation with one l in query filters.
            EventStatus::Cancelled => "canceled",
            other => other.as_str(),
        }
    }

    /// Normalize a source-reported status string.
    ///
    /// Unknown spellings map to `Active` rather than failing the record —
    /// a vendor spelling change should not abort a whole status page. The
    /// caller logs a warning so the new spelling gets taught.
    pub fn parse_lossy(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "active" | "scheduled" | "confirmed" => EventStatus::Active,
            "completed" | "complete" | "done" => EventStatus::Completed,
            "cancelled" | "canceled" => EventStatus::Cancelled,
            "no_show" | "noshow" | "no-show" => EventStatus::NoShow,
            other => {
                log::warn!("Unknown booking status '{}', treating as active", other);
                EventStatus::Active
            }
        }
    }

    /// Terminal statuses never transition again at the source.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventStatus::Active)
    }

    /// The full status set a default sync run covers. The source cannot
    /// filter multiple statuses in one call, so each entry is one walk.
    pub const ALL: [EventStatus; 4] = [
        EventStatus::Active,
        EventStatus::Completed,
        EventStatus::Cancelled,
        EventStatus::NoShow,
    ];
}

/// Why a sync run was triggered. Selects the default window policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    /// Short recent window; the scheduler's steady-state cadence.
    Incremental,
    /// Operator-initiated; wider window.
    Manual,
    /// Historical window to catch records missed by earlier runs.
    GapFill,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::Incremental => "incremental",
            TriggerReason::Manual => "manual",
            TriggerReason::GapFill => "gap_fill",
        }
    }

    /// Parse a caller-supplied reason string. Callers send free text
    /// ("gap-fill", "webhook", ...); anything unrecognized is treated as a
    /// manual run, the widest default that is still bounded.
    pub fn parse_lossy(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "incremental" | "scheduled" | "webhook" | "cron" => TriggerReason::Incremental,
            "gap_fill" | "gapfill" | "backfill" => TriggerReason::GapFill,
            _ => TriggerReason::Manual,
        }
    }
}

/// Inbound trigger body, shared by `POST /sync` and the CLI runner.
///
/// All fields are optional: an empty body means "sync every enabled
/// project over the incremental default window".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncRequest {
    pub project_id: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub trigger_reason: Option<String>,
}

impl SyncRequest {
    pub fn reason(&self) -> TriggerReason {
        self.trigger_reason
            .as_deref()
            .map(TriggerReason::parse_lossy)
            .unwrap_or(TriggerReason::Incremental)
    }
}

/// Per-run counters for one project. Folded into the aggregate response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    /// Pages retrieved across all status walks.
    pub pages_fetched: u32,
    /// Outbound API calls, including discovery and invitee lookups.
    pub api_calls: u32,
    /// Events received from the source before dedup/filtering.
    pub fetched: u32,
    /// Events seen more than once across status walks.
    pub duplicates: u32,
    /// Events dropped because their type has no active mapping.
    pub skipped_untracked: u32,
    pub inserted: u32,
    pub updated: u32,
    pub unchanged: u32,
    /// Upserts that failed; those records retry on the next run.
    pub persist_errors: u32,
}

impl SyncStats {
    /// Events that made it through reconciliation this run.
    pub fn events_reconciled(&self) -> u32 {
        self.inserted + self.updated + self.unchanged
    }
}

/// A structured failure inside an otherwise-successful run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    /// Where the failure happened: "auth", "discovery",
    /// "pagination:<status>", "persist", "deadline".
    pub stage: String,
    pub message: String,
}

impl SyncFailure {
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Outcome of reconciling a single project.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSyncReport {
    pub project_id: String,
    pub trigger: TriggerReason,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub stats: SyncStats,
    pub failures: Vec<SyncFailure>,
    /// False when the run aborted before covering every status (missing
    /// token, deadline). Partial results are still committed.
    pub completed: bool,
}

/// Aggregate response returned to the triggering caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    /// Total events reconciled across all projects.
    pub events: u32,
    /// Projects attempted.
    pub projects: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub reports: Vec<ProjectSyncReport>,
}

impl SyncResponse {
    /// Fold per-project reports into the aggregate shape.
    pub fn from_reports(reports: Vec<ProjectSyncReport>) -> Self {
        let events = reports.iter().map(|r| r.stats.events_reconciled()).sum();
        Self {
            success: true,
            events,
            projects: reports.len() as u32,
            timestamp: Utc::now(),
            error: None,
            reports,
        }
    }

    /// Top-level failure: nothing was attempted.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            events: 0,
            projects: 0,
            timestamp: Utc::now(),
            error: Some(message.into()),
            reports: Vec::new(),
        }
    }
}
