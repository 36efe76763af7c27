//! Booking-event reconciliation.
//!
//! One parameterized reconciler covers every trigger (scheduler tick,
//! HTTP request, CLI run); the trigger reason only selects the window
//! policy. Each run is an idempotent merge: fetch a window of external
//! events across the configured statuses, deduplicate by external ID,
//! filter to tracked event types, and upsert with change detection. Racing
//! runs converge through the store's composite-key conflict resolution.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};

use crate::booking_api::{
    BookingApiError, BookingClient, BookingEvent, EventSource, EventsPageQuery, InviteeDetail,
};
use crate::config::AppConfig;
use crate::db::{DbProject, DbSyncRun, EventSyncOutcome, EventUpsert, SyncDb};
use crate::error::SyncError;
use crate::types::{
    EventStatus, ProjectSyncReport, SyncFailure, SyncRequest, SyncResponse, SyncStats,
    TriggerReason,
};
use crate::window::{resolve_window, SyncWindow};

/// Safety ceiling per status walk; guards against a source that keeps
/// handing back continuation tokens.
pub const MAX_PAGES_PER_STATUS: u32 = 50;

/// Politeness pause between consecutive pages.
pub const INTER_PAGE_DELAY_MS: u64 = 250;

/// Consecutive non-rate-limit page failures before a status walk aborts.
pub const MAX_CONSECUTIVE_PAGE_FAILURES: u32 = 3;

/// Rate-limit waits tolerated per status walk before giving up on it.
pub const MAX_RATE_LIMIT_WAITS: u32 = 3;

/// Fallback wait when the source rate-limits without a Retry-After hint.
pub const RATE_LIMIT_FALLBACK_SECS: u64 = 10;

/// Concurrent invitee lookups. Bounded because the source's rate limit is
/// shared per access token, not per call.
pub const INVITEE_FETCH_CONCURRENCY: usize = 4;

/// Parameters for one reconciliation run.
#[derive(Debug, Clone)]
pub struct SyncRunOptions {
    pub reason: TriggerReason,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    /// Statuses to walk; the source filters one per call.
    pub statuses: Vec<EventStatus>,
    /// Wall-clock cutoff checked at page boundaries.
    pub deadline: Option<Instant>,
}

impl SyncRunOptions {
    pub fn from_request(request: &SyncRequest, config: &AppConfig) -> Self {
        Self {
            reason: request.reason(),
            start_date: request.start_date,
            end_date: request.end_date,
            statuses: config.statuses.clone(),
            deadline: Some(
                Instant::now() + std::time::Duration::from_secs(config.run_deadline_secs),
            ),
        }
    }

    fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

// ============================================================================
// Batch entry point
// ============================================================================

/// Sync one project or every enabled project, folding per-project reports
/// into the aggregate response. Auth failures skip their project; the rest
/// of the batch continues.
pub async fn sync_batch(db: &SyncDb, config: &AppConfig, request: &SyncRequest) -> SyncResponse {
    let projects = match resolve_projects(db, request) {
        Ok(projects) => projects,
        Err(e) => return SyncResponse::failure(e.to_string()),
    };

    let options = SyncRunOptions::from_request(request, config);
    log::info!(
        "Sync batch starting: {} project(s), reason={}, window {:?}..{:?}",
        projects.len(),
        options.reason.as_str(),
        options.start_date,
        options.end_date
    );

    let mut reports = Vec::with_capacity(projects.len());
    for project in &projects {
        let report = match project_source(config, project) {
            Ok(source) => sync_project(db, source, project, &options).await,
            Err(e) => {
                log::warn!("Skipping project {}: {}", project.id, e);
                aborted_report(
                    &project.id,
                    options.reason,
                    SyncFailure::new("auth", e.to_string()),
                )
            }
        };
        reports.push(report);
    }

    SyncResponse::from_reports(reports)
}

/// Resolve which projects this request covers. An explicitly requested
/// project runs even when paused; pausing only removes it from batch runs.
fn resolve_projects(db: &SyncDb, request: &SyncRequest) -> Result<Vec<DbProject>, SyncError> {
    match &request.project_id {
        Some(id) => Ok(vec![db
            .get_project(id)?
            .ok_or_else(|| SyncError::ProjectNotFound(id.clone()))?]),
        None => Ok(db.list_enabled_projects()?),
    }
}

/// Build the HTTP event source for a project, or fail its run up front.
fn project_source(
    config: &AppConfig,
    project: &DbProject,
) -> Result<Arc<dyn EventSource>, SyncError> {
    let token = project
        .access_token
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| SyncError::MissingAccessToken(project.id.clone()))?;
    let client = BookingClient::new(&config.api_base_url, token, config.page_size)?;
    Ok(Arc::new(client))
}

/// Report for a project that never got to fetch anything.
fn aborted_report(
    project_id: &str,
    reason: TriggerReason,
    failure: SyncFailure,
) -> ProjectSyncReport {
    let now = Utc::now();
    ProjectSyncReport {
        project_id: project_id.to_string(),
        trigger: reason,
        window_start: now,
        window_end: now,
        stats: SyncStats::default(),
        failures: vec![failure],
        completed: false,
    }
}

// ============================================================================
// Per-project reconciliation
// ============================================================================

/// Reconcile one project over its resolved window.
///
/// Never returns Err: everything that can go wrong inside a run lands in
/// the report's failure list so the caller's batch keeps moving.
pub async fn sync_project(
    db: &SyncDb,
    source: Arc<dyn EventSource>,
    project: &DbProject,
    options: &SyncRunOptions,
) -> ProjectSyncReport {
    let started_at = Utc::now();
    let mut stats = SyncStats::default();
    let mut failures: Vec<SyncFailure> = Vec::new();
    let mut completed = true;

    let tz: chrono_tz::Tz = match project.timezone.parse() {
        Ok(tz) => tz,
        Err(_) => {
            let err = SyncError::InvalidTimezone {
                project: project.id.clone(),
                tz: project.timezone.clone(),
            };
            log::warn!("{}; falling back to UTC", err);
            failures.push(SyncFailure::new("config", err.to_string()));
            chrono_tz::UTC
        }
    };

    let window = match resolve_window(
        options.reason,
        options.start_date,
        options.end_date,
        tz,
        started_at,
    ) {
        Ok(window) => window,
        Err(e) => {
            return aborted_report(
                &project.id,
                options.reason,
                SyncFailure::new("window", e.to_string()),
            );
        }
    };

    log::info!(
        "Syncing project {}: reason={}, window {}..{}",
        project.id,
        options.reason.as_str(),
        window.start.to_rfc3339(),
        window.end.to_rfc3339()
    );

    // Stage 1: refresh the type mapping registry from discovery. A failed
    // discovery falls back to the stored mappings — stale names beat an
    // aborted run.
    let active_types = refresh_mappings(db, source.as_ref(), project, &mut stats, &mut failures)
        .await;

    // Stage 2+3: walk each status, accumulating a per-external-ID map.
    let mut accumulated: HashMap<String, BookingEvent> = HashMap::new();
    for status in &options.statuses {
        if options.deadline_exceeded() {
            if !failures.iter().any(|f| f.stage == "deadline") {
                failures.push(SyncFailure::new("deadline", "run deadline exceeded"));
            }
            completed = false;
            break;
        }
        let aborted = walk_status(
            source.as_ref(),
            project,
            &window,
            *status,
            options,
            &mut accumulated,
            &mut stats,
            &mut failures,
        )
        .await;
        if aborted {
            completed = false;
        }
    }

    // Stage 4: filter to tracked event types.
    let mut survivors: Vec<(BookingEvent, String)> = Vec::new();
    for (_, event) in accumulated {
        match active_types.get(&event.event_type_id) {
            Some(display_name) => survivors.push((event, display_name.clone())),
            None => stats.skipped_untracked += 1,
        }
    }

    // Stage 5: upsert. Existing rows never need an invitee lookup; new rows
    // fetch invitees with bounded concurrency before insert.
    let candidate_ids: Vec<String> = survivors.iter().map(|(e, _)| e.id.clone()).collect();
    let existing_ids = match db.existing_event_ids(&project.id, &candidate_ids) {
        Ok(ids) => ids,
        Err(e) => {
            log::warn!(
                "Project {}: existence probe failed ({}), treating all records as existing",
                project.id,
                e
            );
            failures.push(SyncFailure::new("persist", e.to_string()));
            // Upserts still detect insert-vs-update; only invitee
            // enrichment is lost for this run.
            candidate_ids.iter().cloned().collect()
        }
    };

    let mut new_events: VecDeque<(BookingEvent, String)> = VecDeque::new();
    for (event, display_name) in survivors {
        if existing_ids.contains(&event.id) {
            apply_upsert(db, project, &event, &display_name, None, &mut stats);
        } else {
            new_events.push_back((event, display_name));
        }
    }
    fetch_and_insert_new(db, Arc::clone(&source), project, new_events, &mut stats).await;

    // Stage 6: advance the last-sync marker regardless of what changed.
    let finished_at = Utc::now();
    if let Err(e) = db.mark_project_synced(&project.id, &finished_at.to_rfc3339()) {
        log::warn!("Project {}: failed to advance sync marker: {}", project.id, e);
        failures.push(SyncFailure::new("persist", e.to_string()));
    }

    let report = ProjectSyncReport {
        project_id: project.id.clone(),
        trigger: options.reason,
        window_start: window.start,
        window_end: window.end,
        stats,
        failures,
        completed,
    };
    record_run(db, &report, &started_at.to_rfc3339(), &finished_at.to_rfc3339());

    log::info!(
        "Project {} synced: {} fetched, {} inserted, {} updated, {} unchanged, {} skipped, {} failure(s)",
        report.project_id,
        report.stats.fetched,
        report.stats.inserted,
        report.stats.updated,
        report.stats.unchanged,
        report.stats.skipped_untracked,
        report.failures.len()
    );

    report
}

/// Refresh the mapping registry and return the active filter set
/// (external type ID → display name).
async fn refresh_mappings(
    db: &SyncDb,
    source: &dyn EventSource,
    project: &DbProject,
    stats: &mut SyncStats,
    failures: &mut Vec<SyncFailure>,
) -> HashMap<String, String> {
    stats.api_calls += 1;
    match source.list_event_types(&project.organization_uri).await {
        Ok(types) => {
            let mut seen: Vec<String> = Vec::new();
            for event_type in types.iter().filter(|t| t.active) {
                if let Err(e) = db.ensure_mapping(&project.id, &event_type.id, &event_type.name)
                {
                    log::warn!(
                        "Project {}: failed to upsert mapping {}: {}",
                        project.id,
                        event_type.id,
                        e
                    );
                    failures.push(SyncFailure::new("persist", e.to_string()));
                    continue;
                }
                seen.push(event_type.id.clone());
            }
            match db.deactivate_missing_mappings(&project.id, &seen) {
                Ok(0) => {}
                Ok(n) => log::info!("Project {}: deactivated {} stale mapping(s)", project.id, n),
                Err(e) => failures.push(SyncFailure::new("persist", e.to_string())),
            }
        }
        Err(e) => {
            log::warn!(
                "Project {}: event type discovery failed ({}), using stored mappings",
                project.id,
                e
            );
            failures.push(SyncFailure::new("discovery", e.to_string()));
        }
    }

    match db.list_active_mappings(&project.id) {
        Ok(mappings) => mappings
            .into_iter()
            .map(|m| (m.external_type_id, m.display_name))
            .collect(),
        Err(e) => {
            failures.push(SyncFailure::new("persist", e.to_string()));
            HashMap::new()
        }
    }
}

/// Walk one status's pages into the accumulator. Returns true when the walk
/// aborted early (strikes, rate-limit exhaustion, ceiling, deadline).
#[allow(clippy::too_many_arguments)]
async fn walk_status(
    source: &dyn EventSource,
    project: &DbProject,
    window: &SyncWindow,
    status: EventStatus,
    options: &SyncRunOptions,
    accumulated: &mut HashMap<String, BookingEvent>,
    stats: &mut SyncStats,
    failures: &mut Vec<SyncFailure>,
) -> bool {
    let status_filter = status.query_value();
    let stage = format!("pagination:{}", status.as_str());

    let mut page_token: Option<String> = None;
    let mut pages: u32 = 0;
    let mut strikes: u32 = 0;
    let mut rate_limit_waits: u32 = 0;

    loop {
        if options.deadline_exceeded() {
            failures.push(SyncFailure::new("deadline", "run deadline exceeded"));
            return true;
        }
        if pages >= MAX_PAGES_PER_STATUS {
            log::warn!(
                "Project {}: page ceiling ({}) hit for status {}",
                project.id,
                MAX_PAGES_PER_STATUS,
                status_filter
            );
            failures.push(SyncFailure::new(stage.clone(), "page ceiling reached"));
            return true;
        }

        let query = EventsPageQuery {
            organization: &project.organization_uri,
            min_start_time: window.start,
            max_start_time: window.end,
            status: status_filter,
            page_token: page_token.as_deref(),
        };

        stats.api_calls += 1;
        match source.list_events_page(&query).await {
            Ok(page) => {
                strikes = 0;
                pages += 1;
                stats.pages_fetched += 1;
                stats.fetched += page.events.len() as u32;
                for event in page.events {
                    accumulate_event(accumulated, event, stats);
                }
                page_token = page.next_page_token;
                if page_token.is_none() {
                    return false;
                }
                tokio::time::sleep(std::time::Duration::from_millis(INTER_PAGE_DELAY_MS)).await;
            }
            Err(BookingApiError::RateLimited { retry_after_secs }) => {
                rate_limit_waits += 1;
                if rate_limit_waits > MAX_RATE_LIMIT_WAITS {
                    failures.push(SyncFailure::new(stage.clone(), "rate limit budget exhausted"));
                    return true;
                }
                let wait = retry_after_secs.unwrap_or(RATE_LIMIT_FALLBACK_SECS);
                log::warn!(
                    "Project {}: rate limited on status {}, waiting {}s (attempt {}/{})",
                    project.id,
                    status_filter,
                    wait,
                    rate_limit_waits,
                    MAX_RATE_LIMIT_WAITS
                );
                tokio::time::sleep(std::time::Duration::from_secs(wait)).await;
                // Same page token: retry, don't drop the walk's progress.
            }
            Err(e) => {
                strikes += 1;
                log::warn!(
                    "Project {}: page fetch failed for status {} ({} strike(s)): {}",
                    project.id,
                    status_filter,
                    strikes,
                    e
                );
                if strikes >= MAX_CONSECUTIVE_PAGE_FAILURES {
                    failures.push(SyncFailure::new(stage.clone(), e.to_string()));
                    return true;
                }
                tokio::time::sleep(std::time::Duration::from_millis(INTER_PAGE_DELAY_MS)).await;
            }
        }
    }
}

/// Fold an event into the dedup map. A record can appear under several
/// status filters when the source's filter is inclusive; the reading with
/// the newest source update timestamp wins.
fn accumulate_event(
    accumulated: &mut HashMap<String, BookingEvent>,
    event: BookingEvent,
    stats: &mut SyncStats,
) {
    match accumulated.get(&event.id) {
        None => {
            accumulated.insert(event.id.clone(), event);
        }
        Some(existing) => {
            stats.duplicates += 1;
            let newer = match (event.updated_at, existing.updated_at) {
                (Some(incoming), Some(stored)) => incoming > stored,
                (Some(_), None) => true,
                _ => false,
            };
            if newer {
                accumulated.insert(event.id.clone(), event);
            }
        }
    }
}

/// Fetch invitees for new records with bounded concurrency, inserting each
/// as its lookup completes. A failed lookup inserts the event without
/// invitee identity rather than dropping the record.
async fn fetch_and_insert_new(
    db: &SyncDb,
    source: Arc<dyn EventSource>,
    project: &DbProject,
    mut pending: VecDeque<(BookingEvent, String)>,
    stats: &mut SyncStats,
) {
    type InviteeFetch = (BookingEvent, String, Result<InviteeDetail, BookingApiError>);
    let mut join_set: tokio::task::JoinSet<InviteeFetch> = tokio::task::JoinSet::new();

    let mut spawn_next = |join_set: &mut tokio::task::JoinSet<InviteeFetch>,
                          pending: &mut VecDeque<(BookingEvent, String)>| {
        if let Some((event, display_name)) = pending.pop_front() {
            let source = Arc::clone(&source);
            join_set.spawn(async move {
                let invitee = source.get_invitee(&event.id).await;
                (event, display_name, invitee)
            });
        }
    };

    for _ in 0..INVITEE_FETCH_CONCURRENCY {
        spawn_next(&mut join_set, &mut pending);
    }

    while let Some(joined) = join_set.join_next().await {
        spawn_next(&mut join_set, &mut pending);
        stats.api_calls += 1;
        match joined {
            Ok((event, display_name, invitee_result)) => {
                let invitee = match invitee_result {
                    Ok(invitee) => invitee,
                    Err(e) => {
                        log::warn!(
                            "Project {}: invitee lookup failed for {}: {}",
                            project.id,
                            event.id,
                            e
                        );
                        InviteeDetail::default()
                    }
                };
                apply_upsert(db, project, &event, &display_name, Some(&invitee), stats);
            }
            Err(join_err) => {
                log::error!("Invitee fetch task failed: {}", join_err);
                stats.persist_errors += 1;
            }
        }
    }
}

/// Run one upsert and fold the outcome into the stats. Persistence errors
/// are counted, not propagated: the record retries next run.
fn apply_upsert(
    db: &SyncDb,
    project: &DbProject,
    event: &BookingEvent,
    display_name: &str,
    invitee: Option<&InviteeDetail>,
    stats: &mut SyncStats,
) {
    let input = EventUpsert {
        project_id: &project.id,
        external_id: &event.id,
        event_type_name: display_name,
        scheduled_at: event.start_time,
        status: EventStatus::parse_lossy(&event.status),
        source_created_at: event.created_at,
        source_updated_at: event.updated_at,
        invitee_name: invitee.and_then(|i| i.name.as_deref()),
        invitee_email: invitee.and_then(|i| i.email.as_deref()),
    };
    match db.upsert_event(&input) {
        Ok(EventSyncOutcome::Inserted) => stats.inserted += 1,
        Ok(EventSyncOutcome::Updated) => stats.updated += 1,
        Ok(EventSyncOutcome::Unchanged) => stats.unchanged += 1,
        Err(e) => {
            log::warn!(
                "Project {}: failed to upsert event {}: {}",
                project.id,
                event.id,
                e
            );
            stats.persist_errors += 1;
        }
    }
}

/// Write the audit row. Failures here only warn — the run itself succeeded.
fn record_run(db: &SyncDb, report: &ProjectSyncReport, started_at: &str, finished_at: &str) {
    let failures_json = if report.failures.is_empty() {
        None
    } else {
        serde_json::to_string(&report.failures).ok()
    };
    let run = DbSyncRun {
        id: uuid::Uuid::new_v4().to_string(),
        project_id: report.project_id.clone(),
        trigger_reason: report.trigger.as_str().to_string(),
        window_start: report.window_start.to_rfc3339(),
        window_end: report.window_end.to_rfc3339(),
        started_at: started_at.to_string(),
        finished_at: finished_at.to_string(),
        completed: report.completed,
        pages_fetched: report.stats.pages_fetched,
        api_calls: report.stats.api_calls,
        fetched: report.stats.fetched,
        inserted: report.stats.inserted,
        updated: report.stats.updated,
        unchanged: report.stats.unchanged,
        skipped_untracked: report.stats.skipped_untracked,
        persist_errors: report.stats.persist_errors,
        failures: failures_json,
    };
    if let Err(e) = db.record_sync_run(&run) {
        log::warn!(
            "Failed to record sync run for project {}: {}",
            report.project_id,
            e
        );
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::db::DbProject;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    use crate::booking_api::{EventTypeInfo, EventsPage};

    fn sample_project(id: &str) -> DbProject {
        DbProject {
            id: id.to_string(),
            name: format!("Project {}", id),
            organization_uri: "https://api.booking-platform.com/v2/organizations/org-1".into(),
            access_token: Some("tok".into()),
            timezone: "America/New_York".into(),
            sync_enabled: true,
            last_synced_at: None,
            created_at: Utc::now().to_rfc3339(),
            updated_at: Utc::now().to_rfc3339(),
        }
    }

    fn event(id: &str, event_type: &str, status: &str, updated_min_ago: i64) -> BookingEvent {
        BookingEvent {
            id: id.to_string(),
            event_type_id: event_type.to_string(),
            start_time: fixed_time() + ChronoDuration::days(1),
            created_at: Some(fixed_time() - ChronoDuration::days(1)),
            updated_at: Some(fixed_time() - ChronoDuration::minutes(updated_min_ago)),
            status: status.to_string(),
        }
    }

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
    }

    fn page(events: Vec<BookingEvent>, next: Option<&str>) -> EventsPage {
        EventsPage {
            events,
            next_page_token: next.map(|s| s.to_string()),
        }
    }

    /// In-memory event source. Pages are consumed per status in order;
    /// an exhausted queue yields an empty last page.
    struct MockSource {
        event_types: Result<Vec<EventTypeInfo>, ()>,
        pages: Mutex<HashMap<String, VecDeque<Result<EventsPage, BookingApiError>>>>,
        invitee_calls: Mutex<Vec<String>>,
    }

    impl MockSource {
        fn new(event_types: Vec<EventTypeInfo>) -> Self {
            Self {
                event_types: Ok(event_types),
                pages: Mutex::new(HashMap::new()),
                invitee_calls: Mutex::new(Vec::new()),
            }
        }

        fn tracked_types() -> Vec<EventTypeInfo> {
            vec![
                EventTypeInfo {
                    id: "etype-1".into(),
                    name: "Discovery Call".into(),
                    active: true,
                },
                EventTypeInfo {
                    id: "etype-2".into(),
                    name: "Strategy Session".into(),
                    active: true,
                },
                EventTypeInfo {
                    id: "etype-old".into(),
                    name: "Legacy Intro".into(),
                    active: false,
                },
            ]
        }

        fn queue_page(&self, status: &str, result: Result<EventsPage, BookingApiError>) {
            self.pages
                .lock()
                .entry(status.to_string())
                .or_default()
                .push_back(result);
        }
    }

    #[async_trait]
    impl EventSource for MockSource {
        async fn list_event_types(
            &self,
            _organization: &str,
        ) -> Result<Vec<EventTypeInfo>, BookingApiError> {
            match &self.event_types {
                Ok(types) => Ok(types.clone()),
                Err(_) => Err(BookingApiError::ApiError {
                    status: 500,
                    message: "discovery down".into(),
                }),
            }
        }

        async fn list_events_page(
            &self,
            query: &EventsPageQuery<'_>,
        ) -> Result<EventsPage, BookingApiError> {
            self.pages
                .lock()
                .get_mut(query.status)
                .and_then(|queue| queue.pop_front())
                .unwrap_or_else(|| Ok(EventsPage::default()))
        }

        async fn get_invitee(&self, event_id: &str) -> Result<InviteeDetail, BookingApiError> {
            self.invitee_calls.lock().push(event_id.to_string());
            Ok(InviteeDetail {
                name: Some("Jordan Lee".into()),
                email: Some(format!("{}@example.com", event_id)),
            })
        }
    }

    fn options(statuses: Vec<EventStatus>) -> SyncRunOptions {
        SyncRunOptions {
            reason: TriggerReason::Manual,
            start_date: None,
            end_date: None,
            statuses,
            deadline: None,
        }
    }

    #[tokio::test]
    async fn test_fresh_project_discovery_and_filtering() {
        let db = test_db();
        let project = sample_project("p1");
        db.upsert_project(&project).unwrap();

        let source = MockSource::new(MockSource::tracked_types());
        source.queue_page(
            "active",
            Ok(page(
                vec![
                    event("evt-1", "etype-1", "active", 60),
                    event("evt-2", "etype-2", "active", 60),
                    // Tracked nowhere: inactive at the source.
                    event("evt-3", "etype-old", "active", 60),
                    // Entirely unknown category.
                    event("evt-4", "etype-rogue", "active", 60),
                ],
                None,
            )),
        );

        let report = sync_project(
            &db,
            Arc::new(source),
            &project,
            &options(vec![EventStatus::Active]),
        )
        .await;

        assert!(report.completed);
        assert_eq!(report.stats.inserted, 2);
        assert_eq!(report.stats.skipped_untracked, 2);
        assert_eq!(db.count_events("p1").unwrap(), 2);

        // Only the two active categories became mappings.
        let mappings = db.list_active_mappings("p1").unwrap();
        assert_eq!(mappings.len(), 2);
        assert!(db.get_event("p1", "evt-3").unwrap().is_none());

        // Last-sync marker advanced.
        let stored = db.get_project("p1").unwrap().unwrap();
        assert!(stored.last_synced_at.is_some());
    }

    #[tokio::test]
    async fn test_idempotent_second_run() {
        let db = test_db();
        let project = sample_project("p1");
        db.upsert_project(&project).unwrap();

        let events =
            vec![event("evt-1", "etype-1", "active", 60), event("evt-2", "etype-1", "active", 60)];

        let source = MockSource::new(MockSource::tracked_types());
        source.queue_page("active", Ok(page(events.clone(), None)));
        let first = sync_project(
            &db,
            Arc::new(source),
            &project,
            &options(vec![EventStatus::Active]),
        )
        .await;
        assert_eq!(first.stats.inserted, 2);

        // Same source data again: no inserts, no updates, no invitee calls.
        let source = MockSource::new(MockSource::tracked_types());
        source.queue_page("active", Ok(page(events, None)));
        let source = Arc::new(source);
        let second = sync_project(
            &db,
            source.clone(),
            &project,
            &options(vec![EventStatus::Active]),
        )
        .await;

        assert_eq!(second.stats.inserted, 0);
        assert_eq!(second.stats.updated, 0);
        assert_eq!(second.stats.unchanged, 2);
        assert!(source.invitee_calls.lock().is_empty());
        assert_eq!(db.count_events("p1").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_invitee_fetched_only_for_new_records() {
        let db = test_db();
        let project = sample_project("p1");
        db.upsert_project(&project).unwrap();

        let source = MockSource::new(MockSource::tracked_types());
        source.queue_page(
            "active",
            Ok(page(vec![event("evt-1", "etype-1", "active", 60)], None)),
        );
        let source = Arc::new(source);
        sync_project(
            &db,
            source.clone(),
            &project,
            &options(vec![EventStatus::Active]),
        )
        .await;

        assert_eq!(source.invitee_calls.lock().as_slice(), ["evt-1"]);
        let stored = db.get_event("p1", "evt-1").unwrap().unwrap();
        assert_eq!(stored.invitee_email.as_deref(), Some("evt-1@example.com"));
    }

    #[tokio::test]
    async fn test_dedup_across_status_walks_newest_wins() {
        let db = test_db();
        let project = sample_project("p1");
        db.upsert_project(&project).unwrap();

        let source = MockSource::new(MockSource::tracked_types());
        // The same external ID shows up in both walks; the cancelled
        // reading is newer.
        source.queue_page(
            "active",
            Ok(page(vec![event("evt-1", "etype-1", "active", 120)], None)),
        );
        source.queue_page(
            "canceled",
            Ok(page(vec![event("evt-1", "etype-1", "canceled", 10)], None)),
        );

        let report = sync_project(
            &db,
            Arc::new(source),
            &project,
            &options(vec![EventStatus::Active, EventStatus::Cancelled]),
        )
        .await;

        assert_eq!(report.stats.duplicates, 1);
        assert_eq!(report.stats.inserted, 1);
        assert_eq!(db.count_events("p1").unwrap(), 1);
        let stored = db.get_event("p1", "evt-1").unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_and_keeps_earlier_pages() {
        let db = test_db();
        let project = sample_project("p1");
        db.upsert_project(&project).unwrap();

        let source = MockSource::new(MockSource::tracked_types());
        source.queue_page(
            "active",
            Ok(page(
                vec![event("evt-1", "etype-1", "active", 60)],
                Some("page-2"),
            )),
        );
        source.queue_page(
            "active",
            Err(BookingApiError::RateLimited {
                retry_after_secs: Some(5),
            }),
        );
        source.queue_page(
            "active",
            Ok(page(vec![event("evt-2", "etype-1", "active", 60)], None)),
        );

        let before = tokio::time::Instant::now();
        let report = sync_project(
            &db,
            Arc::new(source),
            &project,
            &options(vec![EventStatus::Active]),
        )
        .await;
        let waited = tokio::time::Instant::now() - before;

        assert!(report.completed);
        assert!(waited >= std::time::Duration::from_secs(5));
        assert_eq!(report.stats.pages_fetched, 2);
        // Page 1's results survived the rate-limit pause.
        assert_eq!(db.count_events("p1").unwrap(), 2);
        assert!(report.failures.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_failures_abort_status_only() {
        let db = test_db();
        let project = sample_project("p1");
        db.upsert_project(&project).unwrap();

        let source = MockSource::new(MockSource::tracked_types());
        for _ in 0..MAX_CONSECUTIVE_PAGE_FAILURES {
            source.queue_page(
                "active",
                Err(BookingApiError::ApiError {
                    status: 502,
                    message: "bad gateway".into(),
                }),
            );
        }
        source.queue_page(
            "canceled",
            Ok(page(vec![event("evt-9", "etype-2", "canceled", 5)], None)),
        );

        let report = sync_project(
            &db,
            Arc::new(source),
            &project,
            &options(vec![EventStatus::Active, EventStatus::Cancelled]),
        )
        .await;

        // The cancelled walk still committed its results.
        assert!(!report.completed);
        assert_eq!(report.stats.inserted, 1);
        assert_eq!(
            db.get_event("p1", "evt-9").unwrap().unwrap().status,
            EventStatus::Cancelled
        );
        assert!(report
            .failures
            .iter()
            .any(|f| f.stage == "pagination:active"));
    }

    #[tokio::test]
    async fn test_discovery_failure_uses_stored_mappings() {
        let db = test_db();
        let project = sample_project("p1");
        db.upsert_project(&project).unwrap();
        db.ensure_mapping("p1", "etype-1", "Discovery Call").unwrap();

        let mut source = MockSource::new(Vec::new());
        source.event_types = Err(());
        source.queue_page(
            "active",
            Ok(page(vec![event("evt-1", "etype-1", "active", 60)], None)),
        );

        let report = sync_project(
            &db,
            Arc::new(source),
            &project,
            &options(vec![EventStatus::Active]),
        )
        .await;

        // The event still landed via the stored mapping.
        assert_eq!(report.stats.inserted, 1);
        assert!(report.failures.iter().any(|f| f.stage == "discovery"));
    }

    #[tokio::test]
    async fn test_terminal_convergence_no_writes() {
        let db = test_db();
        let project = sample_project("p1");
        db.upsert_project(&project).unwrap();

        let cancelled = vec![event("evt-1", "etype-1", "canceled", 60)];
        let source = MockSource::new(MockSource::tracked_types());
        source.queue_page("canceled", Ok(page(cancelled.clone(), None)));
        sync_project(
            &db,
            Arc::new(source),
            &project,
            &options(vec![EventStatus::Cancelled]),
        )
        .await;
        let before = db.get_event("p1", "evt-1").unwrap().unwrap();

        let source = MockSource::new(MockSource::tracked_types());
        source.queue_page("canceled", Ok(page(cancelled, None)));
        let report = sync_project(
            &db,
            Arc::new(source),
            &project,
            &options(vec![EventStatus::Cancelled]),
        )
        .await;

        assert_eq!(report.stats.unchanged, 1);
        assert_eq!(report.stats.updated, 0);
        let after = db.get_event("p1", "evt-1").unwrap().unwrap();
        assert_eq!(before.updated_at, after.updated_at);
    }

    #[tokio::test]
    async fn test_page_ceiling_aborts_walk() {
        let db = test_db();
        let project = sample_project("p1");
        db.upsert_project(&project).unwrap();

        let source = MockSource::new(MockSource::tracked_types());
        // Every page claims another follows.
        for i in 0..(MAX_PAGES_PER_STATUS + 5) {
            source.queue_page(
                "active",
                Ok(page(
                    vec![event(&format!("evt-{}", i), "etype-1", "active", 60)],
                    Some("again"),
                )),
            );
        }

        let report = sync_project(
            &db,
            Arc::new(source),
            &project,
            &options(vec![EventStatus::Active]),
        )
        .await;

        assert!(!report.completed);
        assert_eq!(report.stats.pages_fetched, MAX_PAGES_PER_STATUS);
        // Everything fetched before the ceiling still committed.
        assert_eq!(db.count_events("p1").unwrap(), MAX_PAGES_PER_STATUS as usize);
    }

    #[tokio::test]
    async fn test_audit_row_recorded() {
        let db = test_db();
        let project = sample_project("p1");
        db.upsert_project(&project).unwrap();

        let source = MockSource::new(MockSource::tracked_types());
        source.queue_page(
            "active",
            Ok(page(vec![event("evt-1", "etype-1", "active", 60)], None)),
        );
        sync_project(
            &db,
            Arc::new(source),
            &project,
            &options(vec![EventStatus::Active]),
        )
        .await;

        let runs = db.list_recent_runs("p1", 5).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].inserted, 1);
        assert_eq!(runs[0].trigger_reason, "manual");
        assert!(runs[0].completed);
    }

    #[tokio::test]
    async fn test_batch_skips_project_without_token() {
        let db = test_db();
        let mut project = sample_project("p1");
        project.access_token = None;
        db.upsert_project(&project).unwrap();

        let config = AppConfig::default();
        let request = SyncRequest::default();
        let response = sync_batch(&db, &config, &request).await;

        assert!(response.success);
        assert_eq!(response.projects, 1);
        assert_eq!(response.events, 0);
        assert!(!response.reports[0].completed);
        assert_eq!(response.reports[0].failures[0].stage, "auth");
    }

    #[tokio::test]
    async fn test_batch_unknown_project_fails_cleanly() {
        let db = test_db();
        let config = AppConfig::default();
        let request = SyncRequest {
            project_id: Some("nope".into()),
            ..Default::default()
        };
        let response = sync_batch(&db, &config, &request).await;
        assert!(!response.success);
        assert!(response.error.as_deref().unwrap_or("").contains("nope"));
    }
}
