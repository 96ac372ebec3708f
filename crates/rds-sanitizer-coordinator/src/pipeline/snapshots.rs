//! Snapshot request/await discipline shared by the locator and finalizer

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::control_plane::ControlPlane;
use super::error::PipelineError;
use super::transient_as_pending;
use super::types::{CreateSnapshotRequest, SnapshotInfo, StatusClass, classify_status};
use crate::aws::classify_anyhow_error;
use crate::wait::{WaitConfig, poll_until};

/// Issue a create-snapshot request, deduplicating by name
///
/// "Already exists" acknowledges an earlier request of this run when the
/// existing snapshot was taken from the same instance; a snapshot of that
/// name taken from anything else is a name collision.
pub(crate) async fn request_snapshot<C: ControlPlane>(
    control: &C,
    request: CreateSnapshotRequest,
) -> Result<(), PipelineError> {
    let snapshot_id = request.snapshot_id.clone();
    let db_instance_id = request.db_instance_id.clone();

    match control.create_snapshot(request).await {
        Ok(()) => {
            info!(snapshot = %snapshot_id, db_instance = %db_instance_id, "Snapshot requested");
            Ok(())
        }
        Err(e) if classify_anyhow_error(&e).is_already_exists() => {
            match control.describe_snapshot(&snapshot_id).await? {
                Some(existing) if existing.source_db == db_instance_id => {
                    info!(snapshot = %snapshot_id, "Snapshot already requested");
                    Ok(())
                }
                Some(existing) => Err(PipelineError::InvalidInput(format!(
                    "snapshot name {snapshot_id} is already used by a snapshot of {}",
                    existing.source_db
                ))),
                None => Err(PipelineError::ControlPlane(e)),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Poll a snapshot until it is available
///
/// A snapshot that is not (yet) visible counts as pending, since describe
/// calls lag behind create acknowledgments.
pub(crate) async fn await_snapshot_available<C: ControlPlane>(
    control: &C,
    snapshot_id: &str,
    wait: &WaitConfig,
    cancel: &CancellationToken,
) -> Result<SnapshotInfo, PipelineError> {
    let resource = format!("snapshot {snapshot_id}");
    let snapshot = poll_until(
        wait,
        Some(cancel),
        || async {
            let described =
                transient_as_pending(control.describe_snapshot(snapshot_id).await, &resource)?;
            let Some(snapshot) = described.flatten() else {
                return Ok(None);
            };
            match classify_status(&snapshot.status) {
                StatusClass::Available => Ok(Some(snapshot)),
                StatusClass::Pending => Ok(None),
                StatusClass::Failed => Err(PipelineError::ProvisioningFailed {
                    resource: resource.clone(),
                    detail: format!("status {}", snapshot.status),
                }),
            }
        },
        &resource,
    )
    .await?;

    info!(snapshot = %snapshot_id, "Snapshot available");
    Ok(snapshot)
}
