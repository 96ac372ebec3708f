//! Database setup and schema management

use anyhow::{Context, Result};
use directories::ProjectDirs;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Database connection pool type alias
pub type DbPool = SqlitePool;

/// Default state database path
fn default_db_path() -> Result<PathBuf> {
    let proj_dirs =
        ProjectDirs::from("", "", "rds-sanitizer").context("Failed to get project directories")?;

    let state_dir = proj_dirs.data_local_dir();
    fs::create_dir_all(state_dir).context("Failed to create state directory")?;

    Ok(state_dir.join("state.db"))
}

/// Open the state database, creating it if needed
///
/// Uses the per-user data directory unless `path` is given.
pub async fn open_db(path: Option<&Path>) -> Result<DbPool> {
    let path = match path {
        Some(p) => {
            if let Some(parent) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(parent).context("Failed to create state directory")?;
            }
            p.to_path_buf()
        }
        None => default_db_path()?,
    };
    let db_url = format!("sqlite://{}?mode=rwc", path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .busy_timeout(std::time::Duration::from_secs(10));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open state database {}", path.display()))?;

    setup_schema(&pool).await?;

    Ok(pool)
}

/// Setup database schema
pub(crate) async fn setup_schema(pool: &DbPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            source_db TEXT NOT NULL,
            mode TEXT NOT NULL,
            region TEXT NOT NULL,
            state TEXT NOT NULL,
            context TEXT NOT NULL,
            failure_step TEXT,
            failure_kind TEXT,
            failure_detail TEXT,
            final_snapshot_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            finished_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS resources (
            run_id TEXT NOT NULL REFERENCES runs(run_id),
            kind TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            region TEXT NOT NULL,
            created_at TEXT NOT NULL,
            deleted_at TEXT,
            PRIMARY KEY (run_id, kind, resource_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL REFERENCES runs(run_id),
            at TEXT NOT NULL,
            from_state TEXT,
            to_state TEXT NOT NULL,
            message TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS run_locks (
            source_db TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            acquired_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_source ON runs(source_db)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_run ON run_events(run_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// In-memory database with the schema applied
#[cfg(test)]
pub(crate) async fn open_test_db() -> Result<DbPool> {
    let pool = rds_sanitizer_test_utils::open_test_db().await?;
    setup_schema(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let pool = open_test_db().await.unwrap();
        setup_schema(&pool).await.unwrap();

        let tables: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table'
             AND name IN ('runs', 'resources', 'run_events', 'run_locks')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 4);
    }

    #[tokio::test]
    async fn test_open_db_at_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");

        let pool = open_db(Some(&path)).await.unwrap();
        pool.close().await;
        assert!(path.exists());
    }
}
