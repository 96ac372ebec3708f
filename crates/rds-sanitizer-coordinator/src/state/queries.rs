//! Query operations for state database

use super::db::DbPool;
use super::types::{EventRecord, RunRecord, StoredRun, TrackedResource, parse_timestamp};
use crate::pipeline::{RunContext, RunState};
use anyhow::{Context, Result};
use rds_sanitizer_common::ResourceKind;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

const RUN_COLUMNS: &str = "run_id, source_db, mode, region, state, failure_step, failure_kind,
     failure_detail, final_snapshot_id, created_at, updated_at, finished_at";

fn run_record(row: &SqliteRow) -> Result<RunRecord> {
    let state: String = row.get("state");
    let finished_at: Option<String> = row.get("finished_at");

    Ok(RunRecord {
        run_id: row.get("run_id"),
        source_db: row.get("source_db"),
        mode: row.get("mode"),
        region: row.get("region"),
        state: state
            .parse::<RunState>()
            .with_context(|| format!("Unknown run state '{state}'"))?,
        failure_step: row.get("failure_step"),
        failure_kind: row.get("failure_kind"),
        failure_detail: row.get("failure_detail"),
        final_snapshot_id: row.get("final_snapshot_id"),
        created_at: parse_timestamp(row.get("created_at"))?,
        updated_at: parse_timestamp(row.get("updated_at"))?,
        finished_at: finished_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn tracked_resource(row: &SqliteRow) -> Result<TrackedResource> {
    let kind: String = row.get("kind");
    let deleted_at: Option<String> = row.get("deleted_at");

    Ok(TrackedResource {
        run_id: row.get("run_id"),
        kind: ResourceKind::parse(&kind)
            .with_context(|| format!("Unknown resource kind '{kind}'"))?,
        resource_id: row.get("resource_id"),
        region: row.get("region"),
        created_at: parse_timestamp(row.get("created_at"))?,
        deleted_at: deleted_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

/// Load a run with its persisted context
pub async fn load_run(pool: &DbPool, run_id: &str) -> Result<Option<StoredRun>> {
    let row = sqlx::query(&format!(
        "SELECT {RUN_COLUMNS}, context FROM runs WHERE run_id = ?"
    ))
    .bind(run_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let context_json: String = row.get("context");
    let context: RunContext = serde_json::from_str(&context_json)
        .with_context(|| format!("Corrupt context for run {run_id}"))?;

    Ok(Some(StoredRun {
        record: run_record(&row)?,
        context,
    }))
}

/// Most recent runs first
pub async fn list_runs(pool: &DbPool, limit: u32) -> Result<Vec<RunRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {RUN_COLUMNS} FROM runs ORDER BY created_at DESC LIMIT ?"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(run_record).collect()
}

/// All resources recorded for a run, deleted or not
pub async fn get_run_resources(pool: &DbPool, run_id: &str) -> Result<Vec<TrackedResource>> {
    let rows = sqlx::query(
        "SELECT run_id, kind, resource_id, region, created_at, deleted_at
         FROM resources WHERE run_id = ? ORDER BY created_at",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(tracked_resource).collect()
}

/// Get all undeleted resources
pub async fn get_undeleted_resources(pool: &DbPool) -> Result<Vec<TrackedResource>> {
    let rows = sqlx::query(
        "SELECT run_id, kind, resource_id, region, created_at, deleted_at
         FROM resources WHERE deleted_at IS NULL ORDER BY created_at",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(tracked_resource).collect()
}

/// A run's transition history, oldest first
pub async fn get_run_events(pool: &DbPool, run_id: &str) -> Result<Vec<EventRecord>> {
    let rows = sqlx::query(
        "SELECT at, from_state, to_state, message FROM run_events
         WHERE run_id = ? ORDER BY id",
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(EventRecord {
                at: parse_timestamp(row.get("at"))?,
                from_state: row.get("from_state"),
                to_state: row.get("to_state"),
                message: row.get("message"),
            })
        })
        .collect()
}
