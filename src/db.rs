//! `SQLite` storage handle shared by the settings and log stores.

use crate::error::Result;
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// SQL function lower-casing its argument with full Unicode case mapping.
/// The built-in `lower()` and `LIKE` fold ASCII only.
pub const UNICODE_LOWER: &str = "unicode_lower";

/// Name of the delivery log table.
pub const LOG_TABLE: &str = "email_logs";

/// Version written to the schema marker on install.
pub const SCHEMA_VERSION: &str = "1.1.0";

/// Option row holding the schema version marker.
pub const SCHEMA_VERSION_OPTION: &str = "emailit_db_version";

const OPTIONS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS options (
        name TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
";

const LOG_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS email_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        to_email TEXT NOT NULL,
        subject TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'sent' CHECK (status IN ('sent', 'failed')),
        response TEXT,
        headers TEXT,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_email_logs_status ON email_logs(status);
    CREATE INDEX IF NOT EXISTS idx_email_logs_created_at ON email_logs(created_at);
    CREATE INDEX IF NOT EXISTS idx_email_logs_to_email ON email_logs(to_email);
";

/// Cloneable handle to a single `SQLite` connection.
///
/// Every query takes the lock for its own duration only, so the settings
/// store, the log store and the cleanup task can share one handle.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Create or open a database file at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.create_scalar_function(
            UNICODE_LOWER,
            1,
            FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
            |ctx| Ok(ctx.get::<Option<String>>(0)?.map(|s| s.to_lowercase())),
        )?;
        conn.execute_batch(OPTIONS_SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the log table and record the schema version. Safe to repeat.
    pub fn install(&self) -> Result<()> {
        self.lock().execute_batch(LOG_SCHEMA)?;
        self.put_option(SCHEMA_VERSION_OPTION, SCHEMA_VERSION)?;
        tracing::info!(version = SCHEMA_VERSION, "log table installed");
        Ok(())
    }

    /// Drop the log table and forget every stored option.
    pub fn uninstall(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch("DROP TABLE IF EXISTS email_logs;")?;
        conn.execute("DELETE FROM options", [])?;
        drop(conn);
        tracing::info!("log table dropped and options removed");
        Ok(())
    }

    /// Whether the log table exists.
    pub fn is_installed(&self) -> Result<bool> {
        let found: Option<String> = self
            .lock()
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?",
                params![LOG_TABLE],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// The schema version marker, if the log table was ever installed.
    pub fn schema_version(&self) -> Result<Option<String>> {
        self.get_option(SCHEMA_VERSION_OPTION)
    }

    /// Flush the WAL into the main database file.
    pub fn checkpoint(&self) {
        if let Err(e) = self
            .lock()
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
        {
            tracing::warn!(error = %e, "WAL checkpoint failed");
        } else {
            tracing::info!("SQLite database checkpointed");
        }
    }

    pub(crate) fn get_option(&self, name: &str) -> Result<Option<String>> {
        let value = self
            .lock()
            .query_row(
                "SELECT value FROM options WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub(crate) fn put_option(&self, name: &str, value: &str) -> Result<()> {
        self.lock().execute(
            "INSERT INTO options (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            params![name, value],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_is_idempotent_and_writes_version() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.is_installed().unwrap());
        assert_eq!(db.schema_version().unwrap(), None);

        db.install().unwrap();
        db.install().unwrap();

        assert!(db.is_installed().unwrap());
        assert_eq!(db.schema_version().unwrap().as_deref(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn uninstall_drops_table_and_options() {
        let db = Database::open_in_memory().unwrap();
        db.install().unwrap();
        db.put_option("emailit_settings", "{}").unwrap();

        db.uninstall().unwrap();

        assert!(!db.is_installed().unwrap());
        assert_eq!(db.get_option("emailit_settings").unwrap(), None);
        assert_eq!(db.schema_version().unwrap(), None);
    }
}
