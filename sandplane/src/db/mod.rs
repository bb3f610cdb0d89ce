//! Database layer for sandplane.
//!
//! Provides SQLite-based persistence for:
//! - Sandbox records, transition markers and locks ([`SqliteStateStore`])
//! - Snapshot builds, templates and aliases ([`SqliteTemplateStore`])
//!
//! Sandbox records use a JSON blob with queryable columns. Several API
//! processes on one host can open the same file; WAL mode and the busy
//! timeout let them interleave.

mod schema;
mod state;
mod templates;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension};

use sandplane_shared::errors::{SandplaneError, SandplaneResult};

pub use state::SqliteStateStore;
pub use templates::SqliteTemplateStore;

/// Map a `rusqlite` result into [`SandplaneError::Database`].
macro_rules! db_err {
    ($result:expr) => {
        $result.map_err(|e| SandplaneError::Database(e.to_string()))
    };
}

pub(crate) use db_err;

/// Shared SQLite connection used by the state and template stores.
///
/// One connection per handle, serialized behind a `parking_lot::Mutex`;
/// clones share it.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open `db_path`, creating the file, its parent directory and the schema
    /// as needed.
    pub fn open(db_path: &Path) -> SandplaneResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = db_err!(Connection::open(db_path))?;
        tracing::trace!(path = %db_path.display(), "Opened database");

        // - WAL mode: readers in other processes don't block the writer
        // - Busy timeout: wait for another process's write instead of failing
        db_err!(conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
            PRAGMA busy_timeout=10000;
            "
        ))?;

        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn init_schema(conn: &Connection) -> SandplaneResult<()> {
        for sql in schema::all_schemas() {
            db_err!(conn.execute_batch(sql))?;
        }

        let current_version: Option<i32> = db_err!(
            conn.query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
        )?;

        match current_version {
            None => {
                let now = Utc::now().to_rfc3339();
                db_err!(conn.execute(
                    "INSERT OR IGNORE INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)",
                    rusqlite::params![schema::SCHEMA_VERSION, now],
                ))?;
                tracing::info!(
                    "Initialized database schema version {}",
                    schema::SCHEMA_VERSION
                );
            }
            Some(v) if v > schema::SCHEMA_VERSION => {
                return Err(SandplaneError::Database(format!(
                    "Database schema version {} is newer than supported {}. Please upgrade sandplane.",
                    v,
                    schema::SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }

        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.db");
        Database::open(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_db_reopen_keeps_version() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("test.db");
        drop(Database::open(&db_path).unwrap());

        let db = Database::open(&db_path).unwrap();
        let version: i32 = db
            .conn()
            .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION);
    }

    #[test]
    fn test_db_rejects_newer_schema() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::open(&db_path).unwrap();
        db.conn()
            .execute("UPDATE schema_version SET version = 99 WHERE id = 1", [])
            .unwrap();
        drop(db);

        let err = Database::open(&db_path).unwrap_err();
        assert!(err.to_string().contains("newer than supported"));
    }
}
