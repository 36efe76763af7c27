//! Sync window resolution.
//!
//! One policy, one function: caller-supplied dates are interpreted in the
//! project's IANA timezone and resolved to [local midnight, local midnight)
//! converted to UTC. Default window sizes depend on the trigger reason.
//! On a Sunday evening in New York, UTC midnight is already Monday — using
//! UTC day boundaries would sync the wrong day for US-based projects.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::SyncError;
use crate::types::TriggerReason;

/// Days of history the incremental window covers.
const INCREMENTAL_DAYS_BACK: i64 = 7;
/// Days ahead the incremental window covers (bookings live in the future).
const INCREMENTAL_DAYS_AHEAD: i64 = 30;
const MANUAL_DAYS_BACK: i64 = 30;
const MANUAL_DAYS_AHEAD: i64 = 60;
const GAP_FILL_DAYS_BACK: i64 = 90;
const GAP_FILL_DAYS_AHEAD: i64 = 30;

/// A UTC half-open interval [start, end) bounding a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Resolve the window for a run.
///
/// Explicit dates win; `end_date` is inclusive, so the bound is the
/// midnight *after* it. Missing ends are filled from the reason's default
/// span around `now`.
pub fn resolve_window(
    reason: TriggerReason,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<SyncWindow, SyncError> {
    let (days_back, days_ahead) = match reason {
        TriggerReason::Incremental => (INCREMENTAL_DAYS_BACK, INCREMENTAL_DAYS_AHEAD),
        TriggerReason::Manual => (MANUAL_DAYS_BACK, MANUAL_DAYS_AHEAD),
        TriggerReason::GapFill => (GAP_FILL_DAYS_BACK, GAP_FILL_DAYS_AHEAD),
    };

    let today_local = now.with_timezone(&tz).date_naive();

    let start = match start_date {
        Some(date) => local_midnight_utc(date, tz),
        None => local_midnight_utc(today_local - Duration::days(days_back), tz),
    };
    let end = match end_date {
        Some(date) => local_midnight_utc(date + Duration::days(1), tz),
        None => local_midnight_utc(today_local + Duration::days(days_ahead + 1), tz),
    };

    if start >= end {
        return Err(SyncError::InvalidWindow { start, end });
    }

    Ok(SyncWindow { start, end })
}

/// UTC instant of local midnight on `date` in `tz`.
///
/// DST makes midnight occasionally ambiguous or nonexistent; take the
/// earlier reading when ambiguous, and walk forward by the hour when a
/// spring-forward transition swallowed midnight entirely.
fn local_midnight_utc(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let mut naive = date.and_hms_opt(0, 0, 0).unwrap_or_default();
    for _ in 0..3 {
        match tz.from_local_datetime(&naive) {
            chrono::LocalResult::Single(dt) => return dt.with_timezone(&Utc),
            chrono::LocalResult::Ambiguous(earlier, _) => return earlier.with_timezone(&Utc),
            chrono::LocalResult::None => {
                naive += Duration::hours(1);
            }
        }
    }
    // Three hours past a skipped midnight always resolves; this is the
    // fallback for pathological zone data only.
    Utc.from_utc_datetime(&naive)
}
