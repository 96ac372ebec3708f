//! CLI operations for state management

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use serde::Serialize;

use super::db::DbPool;
use super::lock::force_release;
use super::queries::{get_run_events, get_run_resources, list_runs, load_run};
use super::types::{EventRecord, RunRecord, TrackedResource};
use crate::pipeline::RunState;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn state_cell(state: RunState) -> Cell {
    let cell = Cell::new(state.as_ref());
    match state {
        RunState::Succeeded => cell.fg(Color::Green),
        RunState::Failed => cell.fg(Color::Red),
        RunState::CleanupFailed => cell.fg(Color::Magenta),
        _ => cell.fg(Color::Yellow),
    }
}

fn new_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.iter().map(Cell::new).collect::<Vec<_>>());
    table
}

/// Print the most recent runs
pub async fn list_runs_table(pool: &DbPool, limit: u32) -> Result<()> {
    let runs = list_runs(pool, limit).await?;

    if runs.is_empty() {
        println!("No runs recorded");
        return Ok(());
    }

    let mut table = new_table(&[
        "Run", "Source", "Mode", "State", "Final snapshot", "Started",
    ]);
    for run in runs {
        table.add_row(vec![
            Cell::new(&run.run_id),
            Cell::new(&run.source_db),
            Cell::new(&run.mode),
            state_cell(run.state),
            Cell::new(run.final_snapshot_id.as_deref().unwrap_or("-")),
            Cell::new(run.created_at.format(TIME_FORMAT).to_string()),
        ]);
    }

    println!("{table}");
    Ok(())
}

#[derive(Serialize)]
struct RunStatus {
    #[serde(flatten)]
    run: RunRecord,
    shared_with: Vec<String>,
    cleanup_error: Option<String>,
    resources: Vec<TrackedResource>,
    events: Vec<EventRecord>,
}

/// Print a run's state, resources and transition history
pub async fn show_status(pool: &DbPool, run_id: &str, json: bool) -> Result<()> {
    let stored = load_run(pool, run_id)
        .await?
        .with_context(|| format!("Run {run_id} not found"))?;
    let status = RunStatus {
        shared_with: stored
            .context
            .final_snapshot
            .as_ref()
            .map(|s| s.shared_with.clone())
            .unwrap_or_default(),
        cleanup_error: stored.context.cleanup_error.clone(),
        resources: get_run_resources(pool, run_id).await?,
        events: get_run_events(pool, run_id).await?,
        run: stored.record,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let run = &status.run;
    let mut summary = new_table(&["Field", "Value"]);
    summary.add_row(vec![Cell::new("Run"), Cell::new(&run.run_id)]);
    summary.add_row(vec![Cell::new("Source"), Cell::new(&run.source_db)]);
    summary.add_row(vec![Cell::new("Mode"), Cell::new(&run.mode)]);
    summary.add_row(vec![Cell::new("Region"), Cell::new(&run.region)]);
    summary.add_row(vec![Cell::new("State"), state_cell(run.state)]);
    if let (Some(step), Some(kind)) = (&run.failure_step, &run.failure_kind) {
        summary.add_row(vec![
            Cell::new("Failure"),
            Cell::new(format!(
                "{kind} at {step}: {}",
                run.failure_detail.as_deref().unwrap_or("")
            )),
        ]);
    }
    if let Some(id) = &run.final_snapshot_id {
        summary.add_row(vec![Cell::new("Final snapshot"), Cell::new(id)]);
    }
    if !status.shared_with.is_empty() {
        summary.add_row(vec![
            Cell::new("Shared with"),
            Cell::new(status.shared_with.join(", ")),
        ]);
    }
    if let Some(e) = &status.cleanup_error {
        summary.add_row(vec![Cell::new("Cleanup error"), Cell::new(e).fg(Color::Red)]);
    }
    println!("{summary}");

    if !status.resources.is_empty() {
        let mut table = new_table(&["Kind", "ID", "Created", "Deleted"]);
        for r in &status.resources {
            table.add_row(vec![
                Cell::new(r.kind.as_str()),
                Cell::new(&r.resource_id),
                Cell::new(r.created_at.format(TIME_FORMAT).to_string()),
                match r.deleted_at {
                    Some(at) => Cell::new(at.format(TIME_FORMAT).to_string()),
                    None => Cell::new("still exists").fg(Color::Red),
                },
            ]);
        }
        println!("{table}");
    }

    let mut table = new_table(&["At", "From", "To", "Message"]);
    for e in &status.events {
        table.add_row(vec![
            Cell::new(e.at.format(TIME_FORMAT).to_string()),
            Cell::new(e.from_state.as_deref().unwrap_or("-")),
            Cell::new(&e.to_state),
            Cell::new(&e.message),
        ]);
    }
    println!("{table}");

    Ok(())
}

/// Counts of removed records
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PruneSummary {
    pub runs: u64,
    pub resources: u64,
    pub events: u64,
}

/// Runs finished before the cutoff whose resources are all gone
const PRUNABLE_RUNS: &str = "SELECT run_id FROM runs
     WHERE state IN ('succeeded', 'failed', 'cleanup-failed')
     AND finished_at IS NOT NULL
     AND datetime(finished_at) < datetime('now', ?)
     AND NOT EXISTS (
         SELECT 1 FROM resources
         WHERE resources.run_id = runs.run_id AND resources.deleted_at IS NULL
     )";

/// Remove finished runs older than `days` whose resources are all gone
pub async fn prune_database(pool: &DbPool, days: u32) -> Result<PruneSummary> {
    let cutoff = format!("-{days} days");
    let mut tx = pool.begin().await?;

    let events = sqlx::query(&format!(
        "DELETE FROM run_events WHERE run_id IN ({PRUNABLE_RUNS})"
    ))
    .bind(&cutoff)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    let resources = sqlx::query(&format!(
        "DELETE FROM resources WHERE run_id IN ({PRUNABLE_RUNS})"
    ))
    .bind(&cutoff)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    let runs = sqlx::query(&format!("DELETE FROM runs WHERE run_id IN ({PRUNABLE_RUNS})"))
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;

    Ok(PruneSummary {
        runs,
        resources,
        events,
    })
}

/// Release the lock on `source_db` regardless of which run holds it
pub async fn release_lock(pool: &DbPool, source_db: &str) -> Result<()> {
    match force_release(pool, source_db).await? {
        Some(run_id) => println!("Released lock on {source_db} held by run {run_id}"),
        None => println!("No lock held on {source_db}"),
    }
    Ok(())
}
