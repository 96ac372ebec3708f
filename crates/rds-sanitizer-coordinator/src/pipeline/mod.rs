//! Sanitized snapshot pipeline
//!
//! The components run strictly in sequence, driven by [`RunEngine`]:
//! locate a snapshot, restore an ephemeral instance from it, reset its
//! credential, run the sanitizer, snapshot the result, share it, clean up.
//! Every step persists what it created before waiting on it, so a run can
//! be resumed after a restart and always knows what to clean up.

pub mod cleanup;
pub mod context;
pub mod control_plane;
pub mod engine;
pub mod error;
mod events;
pub mod finalizer;
pub mod locator;
pub mod provisioner;
pub mod sanitizer;
mod snapshots;
pub mod run_state;
pub mod types;

pub use cleanup::{CleanupReport, DeleteOutcome, cleanup_run, delete_and_wait};
pub use context::{FinalSnapshot, RunContext, RunInputs, SnapshotRef};
pub use control_plane::ControlPlane;
pub use engine::{RunEngine, RunLocked, RunOutcome};
pub use error::{Failure, FailureKind, PipelineError, ShareFailure};
pub use sanitizer::{SanitizationJob, Sanitizer, TaskHandle, TaskStatus};
pub use run_state::RunState;
pub use types::{
    CreateSnapshotRequest, DbInstanceInfo, Endpoint, NetworkConfig, RestoreInstanceRequest,
    SnapshotInfo, SnapshotMode, SourceDatabase, Tags,
};

use rds_sanitizer_common::ResourceKind;
use tracing::warn;

use crate::aws::is_retryable;
use crate::state::RunStore;

/// A control-plane read made while waiting
///
/// Transient failures yield `None`, so the wait polls again instead of
/// failing the step; anything else is a control-plane error.
pub(crate) fn transient_as_pending<T>(
    result: anyhow::Result<T>,
    resource: &str,
) -> Result<Option<T>, PipelineError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if is_retryable(&e) => {
            warn!(resource, error = %e, "Transient error while waiting, polling again");
            Ok(None)
        }
        Err(e) => Err(PipelineError::ControlPlane(e)),
    }
}

/// Persist the context; a run that cannot record progress must stop
pub(crate) async fn persist(store: &RunStore, ctx: &RunContext) -> Result<(), PipelineError> {
    store
        .save_context(ctx)
        .await
        .map_err(PipelineError::Persistence)
}

/// Record an ephemeral resource in the context and the resource table
/// before it is requested
pub(crate) async fn record_resource(
    store: &RunStore,
    ctx: &RunContext,
    kind: ResourceKind,
    resource_id: &str,
) -> Result<(), PipelineError> {
    store
        .record_resource(ctx.run_id.as_str(), kind, resource_id)
        .await
        .map_err(PipelineError::Persistence)?;
    persist(store, ctx).await
}

/// Millisecond waits for tests that touch the state database, which does
/// not tolerate paused time
#[cfg(test)]
pub(crate) fn fast_wait() -> crate::wait::WaitConfig {
    use std::time::Duration;

    crate::wait::WaitConfig {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        timeout: Duration::from_secs(5),
        jitter: false,
    }
}
