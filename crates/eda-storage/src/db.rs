//! Database connection management.
//!
//! Wraps a single rusqlite Connection in a Mutex for thread-safe access.
//! Configures WAL mode, foreign keys and a busy timeout on initialization.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, Transaction};
use tracing::info;

use eda_core::error::EdaError;

use crate::migrations;

/// Thread-safe SQLite database wrapper.
///
/// The connection is wrapped in a Mutex since rusqlite Connection is not Sync.
/// Foreign keys are always enabled: referential integrity of activations is
/// enforced by the database, not by callers.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database at the given path and run pending migrations.
    pub fn new(path: &Path) -> Result<Self, EdaError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| EdaError::Storage(format!("Failed to open database: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(|e| EdaError::Storage(format!("Failed to set pragmas: {}", e)))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| EdaError::Storage(format!("Failed to set busy timeout: {}", e)))?;

        info!("Database opened at {}", path.display());

        Self::init(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, EdaError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EdaError::Storage(format!("Failed to open in-memory db: {}", e)))?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| EdaError::Storage(format!("Failed to set pragmas: {}", e)))?;

        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, EdaError> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Execute a closure with a reference to the underlying connection.
    ///
    /// The mutex is held for the duration of the closure.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, EdaError>
    where
        F: FnOnce(&Connection) -> Result<T, EdaError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| EdaError::Storage(format!("Database lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a closure inside a transaction, committing if it returns Ok.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, EdaError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, EdaError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| EdaError::Storage(format!("Database lock poisoned: {}", e)))?;
        let tx = conn
            .transaction()
            .map_err(|e| EdaError::Storage(format!("Failed to begin transaction: {}", e)))?;
        let value = f(&tx)?;
        tx.commit()
            .map_err(|e| EdaError::Storage(format!("Failed to commit: {}", e)))?;
        Ok(value)
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

    fn count_activations(db: &Database) -> i64 {
        db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM activations", [], |row| row.get(0))
                .map_err(|e| EdaError::Storage(e.to_string()))
        })
        .unwrap()
    }

    #[test]
    fn test_in_memory_database() {
        let db = Database::in_memory().unwrap();
        assert_eq!(count_activations(&db), 0);
    }

    #[test]
    fn test_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("eda.db");
        let db = Database::new(&path).unwrap();

        assert_eq!(count_activations(&db), 0);
        assert!(path.exists());
    }

    #[test]
    fn test_foreign_keys_enabled() {
        let db = Database::in_memory().unwrap();
        let enabled: i64 = db
            .with_conn(|conn| {
                conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))
                    .map_err(|e| EdaError::Storage(e.to_string()))
            })
            .unwrap();
        assert_eq!(enabled, 1);
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let db = Database::in_memory().unwrap();
        let result: Result<(), EdaError> = db.with_tx(|tx| {
            tx.execute(
                "INSERT INTO activations (name, created_at, modified_at, status_updated_at)
                 VALUES ('demo', 0, 0, 0)",
                [],
            )
            .map_err(|e| EdaError::Storage(e.to_string()))?;
            Err(EdaError::Storage("abort".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(count_activations(&db), 0);
    }
}
