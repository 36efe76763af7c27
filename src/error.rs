//! Error types for sync execution
//!
//! Errors are classified by recoverability:
//! - Retryable: rate limits, transient network/server failures
//! - NonRetryable: configuration problems, invalid windows
//! - Per-project: auth failures skip that project and the batch continues

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::booking_api::BookingApiError;
use crate::db::DbError;

/// Error types for sync execution.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("No access token configured for project {0}")]
    MissingAccessToken(String),

    #[error("Invalid timezone '{tz}' for project {project}")]
    InvalidTimezone { project: String, tz: String },

    #[error("Invalid window: start {start} is not before end {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Booking API error: {0}")]
    Api(#[from] BookingApiError),

    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

impl SyncError {
    /// Returns true if retrying the same operation could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Api(api) => api.is_retryable(),
            SyncError::Db(_) => false,
            SyncError::ProjectNotFound(_)
            | SyncError::MissingAccessToken(_)
            | SyncError::InvalidTimezone { .. }
            | SyncError::InvalidWindow { .. }
            | SyncError::Configuration(_) => false,
        }
    }
}
