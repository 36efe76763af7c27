//! Shared application state for the long-running service.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::config::AppConfig;
use crate::db::{DbError, SyncDb};

/// State shared between the trigger server and the scheduler.
///
/// The database handle is deliberately not held here: every run opens its
/// own connection (WAL keeps them compatible), matching how triggers race
/// in production — the store's upsert conflict handling is the safety net.
pub struct AppState {
    pub config: AppConfig,
    last_scheduled_run: Mutex<Option<DateTime<Utc>>>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            last_scheduled_run: Mutex::new(None),
        }
    }

    /// Open a database connection at the configured (or default) path.
    pub fn open_db(&self) -> Result<SyncDb, DbError> {
        match &self.config.database_path {
            Some(path) => SyncDb::open_at(path.clone()),
            None => SyncDb::open(),
        }
    }

    /// When the scheduler last fired, if it has this process lifetime.
    pub fn last_scheduled_run(&self) -> Option<DateTime<Utc>> {
        *self.last_scheduled_run.lock()
    }

    pub fn set_last_scheduled_run(&self, at: DateTime<Utc>) {
        *self.last_scheduled_run.lock() = Some(at);
    }
}
