//! Read-only status surface over the state store

#[cfg(feature = "http")]
mod server;

#[cfg(feature = "http")]
pub use server::{StatusServer, DEFAULT_STATUS_ADDR};

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::StateStore;
use crate::types::SyncOutcome;

/// Lazily opened read-only view of the state store.
///
/// The database may not exist until the daemon's first write. Until then
/// queries return no rows, and opening is retried on every query.
#[derive(Clone)]
pub struct StatusReader {
    db_path: String,
    store: Arc<Mutex<Option<StateStore>>>,
}

impl StatusReader {
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            store: Arc::new(Mutex::new(None)),
        }
    }

    /// Serve an already open store (tests, in-process use)
    pub fn from_store(store: StateStore) -> Self {
        Self {
            db_path: store.db_path().to_string(),
            store: Arc::new(Mutex::new(Some(store))),
        }
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// All recorded outcomes, ordered by repository
    pub fn snapshot(&self) -> Result<Vec<SyncOutcome>> {
        let mut guard = self.store.lock();
        if guard.is_none() {
            if !Path::new(&self.db_path).exists() {
                return Ok(Vec::new());
            }
            let store = StateStore::open_read_only(self.db_path.clone())?;
            tracing::debug!("Opened state store {} for status queries", self.db_path);
            *guard = Some(store);
        }
        match guard.as_ref() {
            Some(store) => store.get_all(),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_reader_opens_once_database_exists() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("state.db").to_string_lossy().to_string();
        let reader = StatusReader::new(db_path.clone());

        assert!(reader.snapshot().unwrap().is_empty());

        let writer = StateStore::open(db_path).unwrap();
        writer.put(&SyncOutcome::success("a")).unwrap();

        let rows = reader.snapshot().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].repo_name, "a");
    }

    #[test]
    fn test_unreadable_database_is_error() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("state.db");
        std::fs::write(&db_path, "not a database\n".repeat(64)).unwrap();
        let reader = StatusReader::new(db_path.to_string_lossy());

        assert!(reader.snapshot().is_err());
    }
}
