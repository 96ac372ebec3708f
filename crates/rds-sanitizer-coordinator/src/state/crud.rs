//! CRUD operations for state database

use super::db::DbPool;
use crate::pipeline::{RunContext, RunState};
use anyhow::{Context, Result};
use chrono::Utc;
use rds_sanitizer_common::ResourceKind;

/// Insert a new run in its initial state
pub async fn insert_run(
    pool: &DbPool,
    ctx: &RunContext,
    state: RunState,
    region: &str,
) -> Result<()> {
    let context_json = serde_json::to_string(ctx).context("Failed to serialize run context")?;
    let now = Utc::now().to_rfc3339();

    sqlx::query(
        "INSERT INTO runs (run_id, source_db, mode, region, state, context, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(ctx.run_id.as_str())
    .bind(&ctx.inputs.source_db)
    .bind(ctx.inputs.mode.as_ref())
    .bind(region)
    .bind(state.as_ref())
    .bind(&context_json)
    .bind(ctx.started_at.to_rfc3339())
    .bind(&now)
    .execute(pool)
    .await
    .with_context(|| format!("Failed to insert run {}", ctx.run_id))?;

    Ok(())
}

/// Persist the run's state together with its context
///
/// Failure columns are denormalized from the context so runs can be listed
/// without deserializing it; `finished_at` is set on the first terminal save.
pub async fn save_run(pool: &DbPool, ctx: &RunContext, state: RunState) -> Result<()> {
    let context_json = serde_json::to_string(ctx).context("Failed to serialize run context")?;
    let now = Utc::now().to_rfc3339();
    let finished_at = state.is_terminal().then(|| now.clone());
    let failure = ctx.failure.as_ref();
    let detail = match (failure, ctx.cleanup_error.as_deref()) {
        (Some(f), Some(cleanup)) => Some(format!("{}; {cleanup}", f.message)),
        (Some(f), None) => Some(f.message.clone()),
        (None, cleanup) => cleanup.map(str::to_string),
    };
    let final_snapshot = ctx.final_snapshot.as_ref().map(|s| s.identifier.as_str());

    let result = sqlx::query(
        "UPDATE runs SET state = ?, context = ?, failure_step = ?, failure_kind = ?,
                failure_detail = ?, final_snapshot_id = ?, updated_at = ?,
                finished_at = COALESCE(finished_at, ?)
         WHERE run_id = ?",
    )
    .bind(state.as_ref())
    .bind(&context_json)
    .bind(failure.map(|f| f.step.to_string()))
    .bind(failure.map(|f| f.kind.to_string()))
    .bind(detail)
    .bind(final_snapshot)
    .bind(&now)
    .bind(finished_at)
    .bind(ctx.run_id.as_str())
    .execute(pool)
    .await
    .with_context(|| format!("Failed to save run {}", ctx.run_id))?;

    if result.rows_affected() == 0 {
        anyhow::bail!("Run {} is not in the state database", ctx.run_id);
    }

    Ok(())
}

/// Persist only the context, leaving the state untouched
pub async fn save_context(pool: &DbPool, ctx: &RunContext) -> Result<()> {
    let context_json = serde_json::to_string(ctx).context("Failed to serialize run context")?;

    sqlx::query("UPDATE runs SET context = ?, updated_at = ? WHERE run_id = ?")
        .bind(&context_json)
        .bind(Utc::now().to_rfc3339())
        .bind(ctx.run_id.as_str())
        .execute(pool)
        .await
        .with_context(|| format!("Failed to save context of run {}", ctx.run_id))?;

    Ok(())
}

/// Record an ephemeral resource; recording the same resource twice is a no-op
pub async fn insert_resource(
    pool: &DbPool,
    run_id: &str,
    kind: ResourceKind,
    resource_id: &str,
    region: &str,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();

    sqlx::query(
        "INSERT OR IGNORE INTO resources (run_id, kind, resource_id, region, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(run_id)
    .bind(kind.as_str())
    .bind(resource_id)
    .bind(region)
    .bind(&now)
    .execute(pool)
    .await?;

    Ok(())
}

/// Mark a resource as deleted
pub async fn mark_resource_deleted(
    pool: &DbPool,
    kind: ResourceKind,
    resource_id: &str,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();

    sqlx::query(
        "UPDATE resources SET deleted_at = ?
         WHERE kind = ? AND resource_id = ? AND deleted_at IS NULL",
    )
    .bind(&now)
    .bind(kind.as_str())
    .bind(resource_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Append an entry to a run's history
pub async fn insert_event(
    pool: &DbPool,
    run_id: &str,
    from: Option<RunState>,
    to: RunState,
    message: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO run_events (run_id, at, from_state, to_state, message)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(run_id)
    .bind(Utc::now().to_rfc3339())
    .bind(from.map(|s| s.to_string()))
    .bind(to.as_ref())
    .bind(message)
    .execute(pool)
    .await?;

    Ok(())
}
