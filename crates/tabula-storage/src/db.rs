//! Database connection management.
//!
//! Wraps a single rusqlite Connection in a Mutex for thread-safe access.
//! Configures WAL mode and recommended PRAGMAs on initialization.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, Transaction};
use tracing::info;

use tabula_core::error::{Result, TabulaError};

use crate::migrations;

/// Thread-safe SQLite database wrapper.
///
/// Every caller goes through the mutex, so at most one unit of work runs at a
/// time. Writes additionally run inside a transaction via [`Database::with_tx`].
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database at the given path.
    ///
    /// Configures WAL mode, synchronous=NORMAL, foreign keys, and runs
    /// all pending migrations.
    pub fn new(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| TabulaError::Storage(format!("Failed to open database: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA cache_size = -65536;",
        )
        .map_err(|e| TabulaError::Storage(format!("Failed to set pragmas: {}", e)))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| TabulaError::Storage(format!("Failed to set busy timeout: {}", e)))?;

        info!("Database opened at {}", path.display());

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| TabulaError::Storage(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| TabulaError::Storage(format!("Failed to set pragmas: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Execute a closure with a reference to the underlying connection.
    ///
    /// Used for reads. The mutex is held for the duration of the closure.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TabulaError::Storage(format!("Database lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a closure as one atomic unit of work.
    ///
    /// The transaction commits only if the closure returns `Ok`; any error
    /// rolls back everything the closure wrote.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| TabulaError::Storage(format!("Database lock poisoned: {}", e)))?;
        let tx = conn
            .transaction()
            .map_err(|e| TabulaError::Storage(format!("Failed to begin transaction: {}", e)))?;
        let out = f(&tx)?;
        tx.commit()
            .map_err(|e| TabulaError::Storage(format!("Failed to commit transaction: {}", e)))?;
        Ok(out)
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

    fn count_tables(conn: &Connection) -> Result<i64> {
        conn.query_row("SELECT COUNT(*) FROM catalog_tables", [], |row| row.get(0))
            .map_err(|e| TabulaError::Storage(e.to_string()))
    }

    #[test]
    fn test_in_memory_database() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.with_conn(count_tables).unwrap(), 0);
    }

    #[test]
    fn test_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.db");
        let db = Database::new(&path, Duration::from_millis(100)).unwrap();
        assert_eq!(db.with_conn(count_tables).unwrap(), 0);
        assert!(path.exists());
    }

    #[test]
    fn test_wal_mode_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&dir.path().join("wal.db"), Duration::from_millis(100)).unwrap();
        let mode: String = db
            .with_conn(|conn| {
                conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))
                    .map_err(|e| TabulaError::Storage(e.to_string()))
            })
            .unwrap();
        assert_eq!(mode, "wal");
    }

    #[test]
    fn test_with_tx_commits_on_ok() {
        let db = Database::in_memory().unwrap();
        db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO catalog_tables (id, name, definition, created_at)
                 VALUES ('t1', 'contacts', '{}', 0)",
                [],
            )
            .map_err(|e| TabulaError::Storage(e.to_string()))?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.with_conn(count_tables).unwrap(), 1);
    }

    #[test]
    fn test_with_tx_rolls_back_on_err() {
        let db = Database::in_memory().unwrap();
        let result: Result<()> = db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO catalog_tables (id, name, definition, created_at)
                 VALUES ('t1', 'contacts', '{}', 0)",
                [],
            )
            .map_err(|e| TabulaError::Storage(e.to_string()))?;
            Err(TabulaError::validation("Name", "boom"))
        });
        assert!(result.is_err());
        assert_eq!(db.with_conn(count_tables).unwrap(), 0);
    }
}
