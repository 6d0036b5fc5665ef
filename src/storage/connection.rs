//! Database connection management for the state store
//!
//! One mutex-guarded SQLite connection in WAL mode. Every write is a single
//! statement inside a transaction, so readers on other connections only ever
//! see complete rows.

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;

use super::migrations::run_migrations;
use super::queries;
use crate::error::{MirrorError, Result};
use crate::types::SyncOutcome;

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to SQLite database, or `:memory:`
    pub db_path: String,
    /// Open without write access and skip migrations (status readers)
    pub read_only: bool,
}

/// Durable record of the last sync outcome per repository
pub struct StateStore {
    config: StoreConfig,
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    /// Open or create a database at `db_path`
    pub fn open(db_path: impl Into<String>) -> Result<Self> {
        Self::open_with_config(StoreConfig {
            db_path: db_path.into(),
            read_only: false,
        })
    }

    /// Open an existing database for reading only
    pub fn open_read_only(db_path: impl Into<String>) -> Result<Self> {
        Self::open_with_config(StoreConfig {
            db_path: db_path.into(),
            read_only: true,
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    /// Open or create a database with the given configuration
    pub fn open_with_config(config: StoreConfig) -> Result<Self> {
        let conn = Self::create_connection(&config).map_err(MirrorError::into_store_error)?;

        if !config.read_only {
            run_migrations(&conn).map_err(MirrorError::into_store_error)?;
        }

        Ok(Self {
            config,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a new connection with appropriate pragmas
    fn create_connection(config: &StoreConfig) -> Result<Connection> {
        if config.db_path == ":memory:" {
            return Ok(Connection::open_in_memory()?);
        }

        let conn = if config.read_only {
            Connection::open_with_flags(
                &config.db_path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            // Ensure parent directory exists
            if let Some(parent) = Path::new(&config.db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            Connection::open_with_flags(
                &config.db_path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        };

        Self::configure_pragmas(&conn, config.read_only)?;
        Ok(conn)
    }

    /// WAL for concurrent status readers during writes
    fn configure_pragmas(conn: &Connection, read_only: bool) -> Result<()> {
        if read_only {
            conn.execute_batch("PRAGMA busy_timeout=5000;")?;
        } else {
            conn.execute_batch(
                r#"
                PRAGMA journal_mode=WAL;
                PRAGMA synchronous=NORMAL;
                PRAGMA busy_timeout=30000;
                PRAGMA temp_store=MEMORY;
                "#,
            )?;
        }
        Ok(())
    }

    /// Persist or overwrite the row for `outcome.repo_name`
    pub fn put(&self, outcome: &SyncOutcome) -> Result<()> {
        if self.config.read_only {
            return Err(MirrorError::StoreUnavailable(format!(
                "{} is opened read-only",
                self.config.db_path
            )));
        }
        self.with_transaction(|conn| queries::upsert_outcome(conn, outcome))
            .map_err(MirrorError::into_store_error)
    }

    /// Full current snapshot
    pub fn get_all(&self) -> Result<Vec<SyncOutcome>> {
        self.with_connection(queries::list_outcomes)
            .map_err(MirrorError::into_store_error)
    }

    /// Latest outcome for one repository
    pub fn get(&self, repo_name: &str) -> Result<Option<SyncOutcome>> {
        self.with_connection(|conn| queries::get_outcome(conn, repo_name))
            .map_err(MirrorError::into_store_error)
    }

    /// Administrative removal of a repository's row
    pub fn forget(&self, repo_name: &str) -> Result<bool> {
        self.with_transaction(|conn| queries::delete_outcome(conn, repo_name))
            .map_err(MirrorError::into_store_error)
    }

    /// Execute a function with the connection
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a function with a transaction
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Checkpoint WAL file
    pub fn checkpoint(&self) -> Result<()> {
        if self.config.read_only || self.config.db_path == ":memory:" {
            return Ok(());
        }
        let conn = self.conn.lock();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> &str {
        &self.config.db_path
    }

    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }
}

impl Clone for StateStore {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            conn: self.conn.clone(),
        }
    }
}
