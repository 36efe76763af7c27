//! Scheduler for cron-based incremental sync runs
//!
//! A poll loop rather than a timer wheel:
//! - Cron expression parsing with timezone-aware evaluation
//! - Sleep/wake detection via time-jump polling
//! - Missed run handling (runs if within grace period)

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use crate::config::ScheduleEntry;
use crate::error::SyncError;
use crate::reconcile::sync_batch;
use crate::state::AppState;
use crate::types::SyncRequest;

/// Grace period for missed runs (2 hours).
const MISSED_RUN_GRACE_PERIOD_SECS: i64 = 7200;

/// Time jump threshold to detect sleep/wake (5 minutes).
const TIME_JUMP_THRESHOLD_SECS: i64 = 300;

/// Poll interval for the scheduler loop (1 minute).
const POLL_INTERVAL_SECS: u64 = 60;

/// Scheduler driving incremental syncs off the configured cron entry.
pub struct Scheduler {
    state: Arc<AppState>,
}

impl Scheduler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Run the scheduler loop indefinitely, checking for due runs every
    /// minute and catching up after sleep/wake gaps.
    pub async fn run(&self) {
        let entry = self.state.config.schedule.clone();
        if !entry.enabled {
            log::info!("Scheduler disabled by configuration");
            return;
        }

        log::info!(
            "Scheduler running: cron '{}' in {}",
            entry.cron,
            entry.timezone
        );

        let mut last_check = Utc::now();
        loop {
            tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;
            let now = Utc::now();

            // Detect sleep: time jumped more than the threshold.
            let time_jump = (now - last_check).num_seconds();
            if time_jump > TIME_JUMP_THRESHOLD_SECS {
                log::info!(
                    "Detected system wake (time jumped {} seconds), checking for missed runs",
                    time_jump
                );
                match self.find_missed_run(&entry, now) {
                    Ok(Some(missed_at)) => {
                        log::info!(
                            "Found missed sync scheduled at {}, running now",
                            missed_at.to_rfc3339()
                        );
                        self.run_scheduled_sync(now).await;
                    }
                    Ok(None) => {}
                    Err(e) => log::warn!("Missed-run check failed: {}", e),
                }
            }

            match self.should_run_now(&entry, now) {
                Ok(true) => self.run_scheduled_sync(now).await,
                Ok(false) => {}
                Err(e) => log::warn!("Schedule evaluation failed: {}", e),
            }

            last_check = now;
        }
    }

    /// Check if the sync should run at the given time.
    fn should_run_now(&self, entry: &ScheduleEntry, now: DateTime<Utc>) -> Result<bool, SyncError> {
        let schedule = parse_cron(&entry.cron)?;
        let tz = parse_timezone(&entry.timezone)?;
        let now_local = now.with_timezone(&tz);

        let last_run = self.state.last_scheduled_run();

        // Find the most recent scheduled time near now.
        let mut scheduled_times = schedule.after(&(now_local - chrono::Duration::minutes(2)));

        if let Some(next_time) = scheduled_times.next() {
            let next_utc = next_time.with_timezone(&Utc);
            let diff = (now - next_utc).num_seconds().abs();

            // Within 2 minutes of the scheduled time (wider window for
            // sleep/wake skew).
            if diff < 120 {
                if let Some(last) = last_run {
                    if (last - next_utc).num_seconds().abs() < 60 {
                        return Ok(false); // Already ran this slot.
                    }
                }
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Find a scheduled time that was missed within the grace period.
    fn find_missed_run(
        &self,
        entry: &ScheduleEntry,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, SyncError> {
        let schedule = parse_cron(&entry.cron)?;
        let tz = parse_timezone(&entry.timezone)?;

        let now_local = now.with_timezone(&tz);
        let grace_start = now_local - chrono::Duration::seconds(MISSED_RUN_GRACE_PERIOD_SECS);

        let last_run = self.state.last_scheduled_run();

        for scheduled in schedule.after(&grace_start) {
            let scheduled_utc = scheduled.with_timezone(&Utc);
            if scheduled_utc > now {
                break;
            }
            if let Some(last) = last_run {
                if last >= scheduled_utc {
                    continue; // Already ran.
                }
            }
            return Ok(Some(scheduled_utc));
        }

        Ok(None)
    }

    /// Execute one incremental batch run and stamp the slot.
    async fn run_scheduled_sync(&self, now: DateTime<Utc>) {
        self.state.set_last_scheduled_run(now);

        let db = match self.state.open_db() {
            Ok(db) => db,
            Err(e) => {
                log::error!("Scheduled sync skipped: failed to open database: {}", e);
                return;
            }
        };

        let request = SyncRequest {
            trigger_reason: Some("incremental".to_string()),
            ..Default::default()
        };
        let response = sync_batch(&db, &self.state.config, &request).await;
        log::info!(
            "Scheduled sync finished: {} project(s), {} event(s), success={}",
            response.projects,
            response.events,
            response.success
        );
    }
}

/// Parse a cron expression.
pub fn parse_cron(expr: &str) -> Result<Schedule, SyncError> {
    // The cron crate expects 6 fields (with seconds), but config uses the
    // conventional 5-field format. Add "0" for seconds at the start.
    let full_expr = format!("0 {}", expr);

    full_expr.parse::<Schedule>().map_err(|e| {
        SyncError::Configuration(format!("Invalid cron expression '{}': {}", expr, e))
    })
}

fn parse_timezone(tz: &str) -> Result<Tz, SyncError> {
    tz.parse()
        .map_err(|_| SyncError::Configuration(format!("Invalid timezone: {}", tz)))
}

/// Get the next scheduled run time for a schedule entry.
pub fn get_next_run_time(entry: &ScheduleEntry) -> Result<DateTime<Utc>, SyncError> {
    let schedule = parse_cron(&entry.cron)?;
    let tz = parse_timezone(&entry.timezone)?;

    let next = schedule
        .upcoming(tz)
        .next()
        .ok_or_else(|| SyncError::Configuration("No upcoming scheduled time".to_string()))?;

    Ok(next.with_timezone(&Utc))
}
