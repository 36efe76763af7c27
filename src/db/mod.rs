//! SQLite-based local store for projects, type mappings, and booking events.
//!
//! The database lives at `~/.funnelsync/funnelsync.db` and is the system of
//! record for reconciled booking data. WAL mode keeps concurrent triggers
//! (scheduler tick racing a manual HTTP run) readable; the composite-key
//! upsert in `events.rs` is what keeps them convergent.

use std::path::PathBuf;

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection};

pub mod types;
pub use types::*;

mod events;
mod mappings;
mod projects;
mod runs;

/// Connection owner. The mutex makes the handle shareable across the async
/// trigger surfaces; statement-level locking is enough because every store
/// operation is a single self-contained call and guards never live across
/// an await.
pub struct SyncDb {
    conn: Mutex<Connection>,
}

impl SyncDb {
    /// Lock the underlying connection for one operation.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, DbError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError>,
    {
        let conn = self.conn();
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(&conn) {
            Ok(val) => {
                conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at the default path and apply the schema.
    pub fn open() -> Result<Self, DbError> {
        Self::open_at(Self::default_path()?)
    }

    /// Open a database at an explicit path. Used for configured overrides
    /// and tests.
    pub fn open_at(path: PathBuf) -> Result<Self, DbError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;

        // WAL for concurrent read performance; busy_timeout so racing
        // reconciliation runs queue on the write lock instead of erroring.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Resolve the default database path: `~/.funnelsync/funnelsync.db`.
    fn default_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".funnelsync").join("funnelsync.db"))
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_open_creates_tables() {
        let db = test_db();
        let count: i32 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM booking_events", [], |row| row.get(0))
            .expect("booking_events table should exist");
        assert_eq!(count, 0);

        let count: i32 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM event_type_mappings", [], |row| {
                row.get(0)
            })
            .expect("event_type_mappings table should exist");
        assert_eq!(count, 0);
    }

    #[test]
    fn test_reopen_same_path() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("reopen.db");
        let _db1 = SyncDb::open_at(path.clone()).expect("first open");
        let _db2 = SyncDb::open_at(path).expect("second open should not fail");
    }

    #[test]
    fn test_with_transaction_rolls_back_on_error() {
        let db = test_db();
        let result: Result<(), DbError> = db.with_transaction(|conn| {
            conn.execute(
                "INSERT INTO projects (id, name, organization_uri, created_at, updated_at)
                 VALUES ('p1', 'Acme', 'org/1', datetime('now'), datetime('now'))",
                [],
            )?;
            Err(DbError::Migration("forced".into()))
        });
        assert!(result.is_err());

        let count: i32 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
