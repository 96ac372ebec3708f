//! Per-source-database run lock
//!
//! At most one non-terminal run may work on a source database at a time.
//! The lock is a row in `run_locks`; a row whose run has reached a terminal
//! state (or no longer exists) is stale and may be taken over.

use super::db::DbPool;
use super::types::parse_timestamp;
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::Row;

/// Outcome of a lock attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// Another active run holds the lock
    Held {
        run_id: String,
        acquired_at: DateTime<Utc>,
    },
}

const TERMINAL_STATES: &str = "('succeeded', 'failed', 'cleanup-failed')";

/// Try to take the lock for `source_db` on behalf of `run_id`
///
/// Re-entrant: a run that already holds the lock acquires it again.
pub async fn acquire(pool: &DbPool, source_db: &str, run_id: &str) -> Result<LockOutcome> {
    let now = Utc::now().to_rfc3339();

    sqlx::query(&format!(
        "INSERT INTO run_locks (source_db, run_id, acquired_at) VALUES (?, ?, ?)
         ON CONFLICT(source_db) DO UPDATE
         SET run_id = excluded.run_id, acquired_at = excluded.acquired_at
         WHERE run_locks.run_id = excluded.run_id
            OR NOT EXISTS (
                SELECT 1 FROM runs
                WHERE runs.run_id = run_locks.run_id
                  AND runs.state NOT IN {TERMINAL_STATES}
            )"
    ))
    .bind(source_db)
    .bind(run_id)
    .bind(&now)
    .execute(pool)
    .await?;

    let row = sqlx::query("SELECT run_id, acquired_at FROM run_locks WHERE source_db = ?")
        .bind(source_db)
        .fetch_one(pool)
        .await?;

    let holder: String = row.get("run_id");
    if holder == run_id {
        Ok(LockOutcome::Acquired)
    } else {
        Ok(LockOutcome::Held {
            run_id: holder,
            acquired_at: parse_timestamp(row.get("acquired_at"))?,
        })
    }
}

/// Release the lock if `run_id` holds it; returns whether it did
pub async fn release(pool: &DbPool, source_db: &str, run_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM run_locks WHERE source_db = ? AND run_id = ?")
        .bind(source_db)
        .bind(run_id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Release the lock regardless of holder; returns the previous holder
pub async fn force_release(pool: &DbPool, source_db: &str) -> Result<Option<String>> {
    let holder: Option<String> =
        sqlx::query_scalar("DELETE FROM run_locks WHERE source_db = ? RETURNING run_id")
            .bind(source_db)
            .fetch_optional(pool)
            .await?;

    Ok(holder)
}
