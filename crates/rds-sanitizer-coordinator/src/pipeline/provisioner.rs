//! Ephemeral database provisioner

use std::cell::Cell;
use std::time::Duration;

use chrono::Utc;
use rds_sanitizer_common::{ConnectionInfo, ResourceKind};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::context::RunContext;
use super::control_plane::ControlPlane;
use super::error::PipelineError;
use super::types::{RestoreInstanceRequest, StatusClass, classify_status};
use super::{persist, record_resource, transient_as_pending};
use crate::aws::classify_anyhow_error;
use crate::credential::Credential;
use crate::state::RunStore;
use crate::wait::{WaitConfig, poll_until};

/// Request the ephemeral instance, restored from `ctx.snapshot`
///
/// The instance identifier is recorded before the request is issued, so
/// cleanup knows about it even if the acknowledgment is lost.
#[instrument(skip_all, fields(run_id = %ctx.run_id, instance = %ctx.instance_id))]
pub async fn provision_instance<C: ControlPlane>(
    control: &C,
    store: &RunStore,
    ctx: &mut RunContext,
) -> Result<(), PipelineError> {
    let snapshot_id = ctx
        .snapshot
        .as_ref()
        .map(|s| s.identifier.clone())
        .ok_or_else(|| PipelineError::InvalidInput("no snapshot located".to_string()))?;
    let instance_id = ctx.instance_id.clone();

    if !ctx.instance_requested {
        ctx.instance_requested = true;
        record_resource(store, ctx, ResourceKind::DbInstance, &instance_id).await?;
    }

    let request = RestoreInstanceRequest {
        instance_id: instance_id.clone(),
        snapshot_id: snapshot_id.clone(),
        network: ctx.inputs.network.clone(),
        tags: ctx.ephemeral_tags(),
    };
    match control.restore_instance(request).await {
        Ok(()) => info!(snapshot = %snapshot_id, "Ephemeral instance requested"),
        // The identifier is unique to this run, so an existing instance is ours
        Err(e) if classify_anyhow_error(&e).is_already_exists() => {
            info!("Ephemeral instance already requested")
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

/// Wait for the ephemeral instance to become available and record its endpoint
pub async fn await_instance_ready<C: ControlPlane>(
    control: &C,
    store: &RunStore,
    ctx: &mut RunContext,
    wait: &WaitConfig,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    let instance_id = ctx.instance_id.clone();
    let resource = format!("instance {instance_id}");

    let instance = poll_until(
        wait,
        Some(cancel),
        || async {
            // Not visible yet right after the restore acknowledgment
            let described =
                transient_as_pending(control.describe_instance(&instance_id).await, &resource)?;
            let Some(instance) = described.flatten() else {
                return Ok(None);
            };
            match classify_status(&instance.status) {
                StatusClass::Available => Ok(Some(instance)),
                StatusClass::Pending => Ok(None),
                StatusClass::Failed => Err(PipelineError::ProvisioningFailed {
                    resource: resource.clone(),
                    detail: format!("status {}", instance.status),
                }),
            }
        },
        &resource,
    )
    .await?;

    let endpoint = instance
        .endpoint
        .ok_or_else(|| PipelineError::ProvisioningFailed {
            resource: resource.clone(),
            detail: "available without an endpoint".to_string(),
        })?;
    let username = instance
        .master_username
        .ok_or_else(|| PipelineError::ProvisioningFailed {
            resource: resource.clone(),
            detail: "no master username".to_string(),
        })?;

    info!(address = %endpoint.address, port = endpoint.port, "Ephemeral instance available");
    ctx.connection = Some(ConnectionInfo {
        host: endpoint.address,
        port: endpoint.port,
        username,
        database: instance.db_name,
    });
    persist(store, ctx).await
}

/// Issue a fresh master credential for the ephemeral instance
///
/// The returned credential is held in memory only.
#[instrument(skip_all, fields(run_id = %ctx.run_id, instance = %ctx.instance_id))]
pub async fn reset_credential<C: ControlPlane>(
    control: &C,
    store: &RunStore,
    ctx: &mut RunContext,
) -> Result<Credential, PipelineError> {
    let engine = ctx
        .source
        .as_ref()
        .map(|s| s.engine)
        .ok_or_else(|| PipelineError::InvalidInput("source database not described".to_string()))?;

    let credential = Credential::generate(&engine.credential_policy());
    control.reset_credential(&ctx.instance_id, &credential).await?;
    info!("Credential reset requested");

    ctx.credential_issued_at = Some(Utc::now());
    persist(store, ctx).await?;
    Ok(credential)
}

/// Wait until the credential change has been applied
///
/// The control plane reports the change asynchronously: the instance first
/// shows a pending modification (or a `resetting-master-credentials`
/// status), then returns to `available` with nothing pending. If the
/// pending phase is never observed, the instance must look settled for
/// `settle` before the change is trusted.
pub async fn await_credential_applied<C: ControlPlane>(
    control: &C,
    ctx: &RunContext,
    wait: &WaitConfig,
    settle: Duration,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    let instance_id = ctx.instance_id.as_str();
    let resource = format!("credential change on instance {instance_id}");
    let started = Instant::now();
    let observed_pending = Cell::new(false);

    poll_until(
        wait,
        Some(cancel),
        || async {
            let Some(described) =
                transient_as_pending(control.describe_instance(instance_id).await, &resource)?
            else {
                return Ok(None);
            };
            let instance = described.ok_or_else(|| PipelineError::ProvisioningFailed {
                resource: format!("instance {instance_id}"),
                detail: "instance no longer exists".to_string(),
            })?;

            match classify_status(&instance.status) {
                StatusClass::Failed => Err(PipelineError::ProvisioningFailed {
                    resource: format!("instance {instance_id}"),
                    detail: format!("status {}", instance.status),
                }),
                StatusClass::Pending => {
                    observed_pending.set(true);
                    Ok(None)
                }
                StatusClass::Available if instance.pending_credential_change => {
                    observed_pending.set(true);
                    Ok(None)
                }
                StatusClass::Available => {
                    if observed_pending.get() || started.elapsed() >= settle {
                        Ok(Some(()))
                    } else {
                        debug!("Credential change not observed yet");
                        Ok(None)
                    }
                }
            }
        },
        &resource,
    )
    .await?;

    info!(instance = %instance_id, "Credential applied");
    Ok(())
}
