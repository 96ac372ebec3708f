//! Snapshot finalizer: captures and distributes the sanitized snapshot

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::context::{FinalSnapshot, RunContext};
use super::control_plane::ControlPlane;
use super::error::{PipelineError, ShareFailure};
use super::persist;
use super::snapshots::{await_snapshot_available, request_snapshot};
use super::types::CreateSnapshotRequest;
use crate::state::RunStore;
use crate::wait::WaitConfig;

/// Request the final snapshot of the sanitized instance
#[instrument(skip_all, fields(run_id = %ctx.run_id, snapshot = %ctx.final_snapshot_id))]
pub async fn request_final_snapshot<C: ControlPlane>(
    control: &C,
    store: &RunStore,
    ctx: &mut RunContext,
) -> Result<(), PipelineError> {
    if !ctx.final_snapshot_requested {
        ctx.final_snapshot_requested = true;
        persist(store, ctx).await?;
    }

    request_snapshot(
        control,
        CreateSnapshotRequest {
            snapshot_id: ctx.final_snapshot_id.clone(),
            db_instance_id: ctx.instance_id.clone(),
            tags: ctx.final_snapshot_tags(),
        },
    )
    .await
}

/// Wait for the final snapshot and check it kept the source's encryption
pub async fn await_final_snapshot<C: ControlPlane>(
    control: &C,
    store: &RunStore,
    ctx: &mut RunContext,
    wait: &WaitConfig,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    let snapshot_id = ctx.final_snapshot_id.clone();
    let snapshot = await_snapshot_available(control, &snapshot_id, wait, cancel).await?;

    let source = ctx
        .source
        .as_ref()
        .ok_or_else(|| PipelineError::InvalidInput("source database not described".to_string()))?;
    if snapshot.encrypted != source.storage_encrypted || snapshot.kms_key_id != source.kms_key_id {
        return Err(PipelineError::ProvisioningFailed {
            resource: format!("snapshot {snapshot_id}"),
            detail: format!(
                "encryption key {} does not match source key {}",
                snapshot.kms_key_id.as_deref().unwrap_or("<none>"),
                source.kms_key_id.as_deref().unwrap_or("<none>"),
            ),
        });
    }

    ctx.final_snapshot = Some(FinalSnapshot {
        identifier: snapshot.identifier,
        kms_key_id: snapshot.kms_key_id,
        shared_with: Vec::new(),
    });
    persist(store, ctx).await
}

/// Grant every configured account restore access to the final snapshot
///
/// Grants are independent: a rejected account does not stop the others,
/// and granted access is never revoked. The snapshot itself is kept
/// whatever happens here.
#[instrument(skip_all, fields(run_id = %ctx.run_id))]
pub async fn share_final_snapshot<C: ControlPlane>(
    control: &C,
    store: &RunStore,
    ctx: &mut RunContext,
) -> Result<(), PipelineError> {
    let Some(final_snapshot) = ctx.final_snapshot.as_ref() else {
        return Err(PipelineError::InvalidInput(
            "final snapshot not available".to_string(),
        ));
    };
    let snapshot_id = final_snapshot.identifier.clone();
    let pending: Vec<String> = ctx
        .inputs
        .share_accounts
        .iter()
        .filter(|a| !final_snapshot.shared_with.contains(*a))
        .cloned()
        .collect();

    let mut failures = Vec::new();
    for account in pending {
        match control.share_snapshot(&snapshot_id, &account).await {
            Ok(()) => {
                info!(snapshot = %snapshot_id, account = %account, "Snapshot shared");
                if let Some(final_snapshot) = ctx.final_snapshot.as_mut() {
                    final_snapshot.shared_with.push(account);
                }
                persist(store, ctx).await?;
            }
            Err(e) => {
                warn!(snapshot = %snapshot_id, account = %account, error = %e, "Sharing rejected");
                failures.push(ShareFailure {
                    account,
                    reason: format!("{e:#}"),
                });
            }
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::SharingFailed {
            failed_accounts: failures,
        })
    }
}
