//! Cleanup coordinator: removes a run's ephemeral resources
//!
//! Deletion is idempotent: a resource that is already gone (or was never
//! created) counts as deleted. Cleanup is not cancellable; a cancelled run
//! still has to release what it created.

use std::cell::Cell;

use rds_sanitizer_common::ResourceKind;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::context::RunContext;
use super::control_plane::ControlPlane;
use super::error::PipelineError;
use super::transient_as_pending;
use crate::aws::classify_anyhow_error;
use crate::state::RunStore;
use crate::wait::{WaitConfig, poll_until};

/// How a resource ended up deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum DeleteOutcome {
    /// Deleted by this call
    Deleted,
    /// Did not exist (never created, or deleted earlier)
    AlreadyGone,
}

/// What a cleanup pass removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<(ResourceKind, String, DeleteOutcome)>,
}

/// Delete every ephemeral resource of the run, instance first
///
/// Every resource is attempted even if an earlier one fails; the error
/// lists everything still present. `wait.timeout` bounds the whole pass:
/// each resource gets what the ones before it left over, and at least one
/// poll, so a later delete is still requested when an earlier one used
/// up the budget.
#[instrument(skip_all, fields(run_id = %ctx.run_id))]
pub async fn cleanup_run<C: ControlPlane>(
    control: &C,
    store: &RunStore,
    ctx: &RunContext,
    wait: &WaitConfig,
) -> Result<CleanupReport, PipelineError> {
    let mut report = CleanupReport::default();
    let mut remaining = Vec::new();
    let mut details = Vec::new();
    let deadline = Instant::now() + wait.timeout;

    for (kind, resource_id) in ctx.ephemeral_resources() {
        let left = deadline
            .saturating_duration_since(Instant::now())
            .max(wait.initial_delay);
        match delete_and_wait(control, kind, &resource_id, &wait.with_timeout(left)).await {
            Ok(outcome) => {
                info!(kind = %kind, resource = %resource_id, outcome = %outcome, "Resource removed");
                if let Err(e) = store.mark_resource_deleted(kind, &resource_id).await {
                    warn!(resource = %resource_id, error = %e, "Failed to record deletion");
                }
                report.removed.push((kind, resource_id, outcome));
            }
            Err(e) => {
                error!(kind = %kind, resource = %resource_id, error = %e, "Failed to remove resource");
                details.push(format!("{kind} {resource_id}: {e}"));
                remaining.push(format!("{kind} {resource_id}"));
            }
        }
    }

    if remaining.is_empty() {
        Ok(report)
    } else {
        Err(PipelineError::CleanupFailed {
            remaining,
            detail: details.join("; "),
        })
    }
}

/// Delete one resource and wait until it no longer exists
///
/// Deletes rejected because the resource is busy (still creating, being
/// modified or backed up) are re-issued on the next poll.
pub async fn delete_and_wait<C: ControlPlane>(
    control: &C,
    kind: ResourceKind,
    resource_id: &str,
    wait: &WaitConfig,
) -> Result<DeleteOutcome, PipelineError> {
    let issued = Cell::new(false);
    let outcome = || {
        if issued.get() {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::AlreadyGone
        }
    };
    let resource = format!("deletion of {kind} {resource_id}");

    let result = poll_until(
        wait,
        None,
        || async {
            let described = match kind {
                ResourceKind::DbInstance => control
                    .describe_instance(resource_id)
                    .await
                    .map(|i| i.map(|i| i.status)),
                ResourceKind::DbSnapshot => control
                    .describe_snapshot(resource_id)
                    .await
                    .map(|s| s.map(|s| s.status)),
            };
            let Some(described) = transient_as_pending(described, &resource)? else {
                return Ok(None);
            };
            let Some(status) = described else {
                return Ok(Some(outcome()));
            };
            if status == "deleting" {
                issued.set(true);
                return Ok(None);
            }

            let deleted = match kind {
                ResourceKind::DbInstance => control.delete_instance(resource_id).await,
                ResourceKind::DbSnapshot => control.delete_snapshot(resource_id).await,
            };
            match deleted {
                Ok(()) => {
                    debug!(resource = %resource_id, "Delete requested");
                    issued.set(true);
                    Ok(None)
                }
                Err(e) => {
                    let classified = classify_anyhow_error(&e);
                    if classified.is_not_found() {
                        Ok(Some(outcome()))
                    } else if classified.is_invalid_state() || classified.is_retryable() {
                        debug!(resource = %resource_id, status = %status, "Resource busy, delete deferred");
                        Ok(None)
                    } else {
                        Err(PipelineError::ControlPlane(e))
                    }
                }
            }
        },
        &resource,
    )
    .await?;

    Ok(result)
}
