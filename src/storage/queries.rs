//! Database queries for sync outcomes

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::types::{SyncOutcome, SyncStatus};

const OUTCOME_COLUMNS: &str = "repo, last_sync_ts, last_status, last_msg";

/// Parse an outcome from a database row
pub fn outcome_from_row(row: &Row) -> rusqlite::Result<SyncOutcome> {
    let repo_name: String = row.get("repo")?;
    let last_sync_ts: Option<i64> = row.get("last_sync_ts")?;
    let last_status: Option<String> = row.get("last_status")?;
    let last_msg: Option<String> = row.get("last_msg")?;

    // Rows written by older tools may hold statuses we don't know
    let status = last_status
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(SyncStatus::Failure);

    Ok(SyncOutcome {
        repo_name,
        timestamp: last_sync_ts
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .unwrap_or_default(),
        status,
        message: last_msg.unwrap_or_default(),
    })
}

/// Insert or fully replace the row for `outcome.repo_name`
pub fn upsert_outcome(conn: &Connection, outcome: &SyncOutcome) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO sync_state (repo, last_sync_ts, last_status, last_msg)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            outcome.repo_name,
            outcome.timestamp.timestamp(),
            outcome.status.as_str(),
            outcome.message,
        ],
    )?;
    Ok(())
}

/// Get the latest outcome for one repository
pub fn get_outcome(conn: &Connection, repo_name: &str) -> Result<Option<SyncOutcome>> {
    let outcome = conn
        .query_row(
            &format!("SELECT {} FROM sync_state WHERE repo = ?1", OUTCOME_COLUMNS),
            params![repo_name],
            outcome_from_row,
        )
        .optional()?;
    Ok(outcome)
}

/// List every stored outcome, ordered by repository name
pub fn list_outcomes(conn: &Connection) -> Result<Vec<SyncOutcome>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM sync_state ORDER BY repo",
        OUTCOME_COLUMNS
    ))?;
    let outcomes = stmt
        .query_map([], outcome_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(outcomes)
}

/// Remove a repository's row. Returns whether a row existed.
pub fn delete_outcome(conn: &Connection, repo_name: &str) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM sync_state WHERE repo = ?1", params![repo_name])?;
    Ok(deleted > 0)
}

/// Count rows by status
pub fn count_by_status(conn: &Connection, status: SyncStatus) -> Result<i64> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM sync_state WHERE last_status = ?1",
        params![status.as_str()],
        |row| row.get(0),
    )?;
    Ok(count)
}
