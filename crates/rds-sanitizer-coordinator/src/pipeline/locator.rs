//! Snapshot locator: resolves the snapshot the ephemeral instance is
//! restored from

use rds_sanitizer_common::{EngineKind, ResourceKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::context::{RunContext, SnapshotRef};
use super::control_plane::ControlPlane;
use super::error::PipelineError;
use super::snapshots::{await_snapshot_available, request_snapshot};
use super::types::{CreateSnapshotRequest, SnapshotMode, SourceDatabase, StatusClass, classify_status};
use super::{persist, record_resource};
use crate::state::RunStore;
use crate::wait::WaitConfig;

/// Describe the source database and check it is something we can restore
pub async fn describe_source<C: ControlPlane>(
    control: &C,
    source_db: &str,
) -> Result<SourceDatabase, PipelineError> {
    let instance = control
        .describe_instance(source_db)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("source database {source_db}")))?;

    if let Some(cluster) = &instance.cluster_identifier {
        return Err(PipelineError::InvalidInput(format!(
            "{source_db} is a member of cluster {cluster}; clusters are not supported"
        )));
    }
    let engine = EngineKind::from_rds_engine(&instance.engine)
        .map_err(|e| PipelineError::InvalidInput(e.to_string()))?;

    Ok(SourceDatabase {
        identifier: instance.identifier,
        engine,
        engine_version: instance.engine_version,
        storage_encrypted: instance.storage_encrypted,
        kms_key_id: instance.kms_key_id,
    })
}

/// Resolve `ctx.snapshot` according to the run's snapshot mode
#[instrument(skip_all, fields(run_id = %ctx.run_id, mode = %ctx.inputs.mode))]
pub async fn locate_snapshot<C: ControlPlane>(
    control: &C,
    store: &RunStore,
    ctx: &mut RunContext,
    wait: &WaitConfig,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    if ctx.source.is_none() {
        let source = describe_source(control, &ctx.inputs.source_db).await?;
        info!(
            source_db = %source.identifier,
            engine = %source.engine,
            encrypted = source.storage_encrypted,
            "Source database described"
        );
        ctx.source = Some(source);
        persist(store, ctx).await?;
    }

    if ctx.snapshot.is_some() {
        return Ok(());
    }
    ensure_final_name_free(control, ctx).await?;

    let snapshot = match ctx.inputs.mode {
        SnapshotMode::ReuseLatest => latest_available(control, &ctx.inputs.source_db).await?,
        SnapshotMode::CreateNew => create_intermediate(control, store, ctx, wait, cancel).await?,
    };

    info!(
        snapshot = %snapshot.identifier,
        created_by_run = snapshot.created_by_run,
        "Snapshot located"
    );
    ctx.snapshot = Some(snapshot);
    persist(store, ctx).await
}

/// Refuse a final snapshot name that is already taken before anything is
/// provisioned; the name is fixed for the run and would otherwise only
/// collide after sanitization
async fn ensure_final_name_free<C: ControlPlane>(
    control: &C,
    ctx: &RunContext,
) -> Result<(), PipelineError> {
    if ctx.final_snapshot_requested {
        return Ok(());
    }
    match control.describe_snapshot(&ctx.final_snapshot_id).await? {
        Some(existing) => Err(PipelineError::InvalidInput(format!(
            "final snapshot {} already exists (taken from {}); choose a name format that is \
             unique per run, e.g. one containing {{run_id}}",
            existing.identifier, existing.source_db
        ))),
        None => Ok(()),
    }
}

/// Most recent available snapshot of `source_db`, manual or automated
async fn latest_available<C: ControlPlane>(
    control: &C,
    source_db: &str,
) -> Result<SnapshotRef, PipelineError> {
    let snapshots = control.describe_snapshots(source_db).await?;

    snapshots
        .into_iter()
        .filter(|s| classify_status(&s.status) == StatusClass::Available)
        .max_by_key(|s| s.created_at)
        .map(|s| SnapshotRef {
            identifier: s.identifier,
            created_by_run: false,
            kms_key_id: s.kms_key_id,
        })
        .ok_or_else(|| PipelineError::NotFound(format!("available snapshot of {source_db}")))
}

/// Take the intermediate snapshot and wait for it
///
/// The identifier is recorded before the request goes out, and the request
/// is re-issued on resume (deduplicated by name).
async fn create_intermediate<C: ControlPlane>(
    control: &C,
    store: &RunStore,
    ctx: &mut RunContext,
    wait: &WaitConfig,
    cancel: &CancellationToken,
) -> Result<SnapshotRef, PipelineError> {
    let snapshot_id = ctx.intermediate_snapshot_id.clone();

    if !ctx.intermediate_snapshot_requested {
        ctx.intermediate_snapshot_requested = true;
        record_resource(store, ctx, ResourceKind::DbSnapshot, &snapshot_id).await?;
    }

    request_snapshot(
        control,
        CreateSnapshotRequest {
            snapshot_id: snapshot_id.clone(),
            db_instance_id: ctx.inputs.source_db.clone(),
            tags: ctx.ephemeral_tags(),
        },
    )
    .await?;

    let snapshot = await_snapshot_available(control, &snapshot_id, wait, cancel).await?;

    Ok(SnapshotRef {
        identifier: snapshot.identifier,
        created_by_run: true,
        kms_key_id: snapshot.kms_key_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::control_plane::MockControlPlane;
    use crate::pipeline::context::test_inputs;
    use crate::pipeline::types::{DbInstanceInfo, SnapshotInfo};
    use crate::pipeline::RunState;
    use chrono::{TimeZone, Utc};
    use crate::pipeline::fast_wait as wait;
    use rds_sanitizer_common::SnapshotNameFormat;

    fn source_instance(engine: &str, cluster: Option<&str>) -> DbInstanceInfo {
        DbInstanceInfo {
            identifier: "prod-db".to_string(),
            engine: engine.to_string(),
            engine_version: Some("16.2".to_string()),
            status: "available".to_string(),
            pending_credential_change: false,
            endpoint: None,
            master_username: Some("admin".to_string()),
            db_name: None,
            storage_encrypted: true,
            kms_key_id: Some("arn:aws:kms:us-east-2:1:key/k".to_string()),
            cluster_identifier: cluster.map(str::to_string),
            tags: vec![],
        }
    }

    fn snapshot(id: &str, status: &str, day: u32) -> SnapshotInfo {
        SnapshotInfo {
            identifier: id.to_string(),
            source_db: "prod-db".to_string(),
            status: status.to_string(),
            encrypted: true,
            kms_key_id: Some("arn:aws:kms:us-east-2:1:key/k".to_string()),
            created_at: Some(Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()),
            tags: vec![],
        }
    }

    async fn setup(mode: SnapshotMode) -> (RunStore, RunContext) {
        let store = RunStore::open_test().await.unwrap();
        let inputs = test_inputs("prod-db", mode);
        let format: SnapshotNameFormat = inputs.name_format.parse().unwrap();
        let ctx = RunContext::new(inputs, &format).unwrap();
        store.insert_run(&ctx, RunState::LocatingSnapshot).await.unwrap();
        (store, ctx)
    }

    #[tokio::test]
    async fn test_reuse_latest_picks_newest_available() {
        let (store, mut ctx) = setup(SnapshotMode::ReuseLatest).await;
        let mut control = MockControlPlane::new();
        control
            .expect_describe_instance()
            .returning(|_| Ok(Some(source_instance("postgres", None))));
        control.expect_describe_snapshot().returning(|_| Ok(None));
        control.expect_describe_snapshots().returning(|_| {
            Ok(vec![
                snapshot("old", "available", 1),
                snapshot("newest-but-creating", "creating", 20),
                snapshot("newer", "available", 14),
            ])
        });
        control.expect_create_snapshot().never();

        locate_snapshot(&control, &store, &mut ctx, &wait(), &CancellationToken::new())
            .await
            .unwrap();

        let snapshot = ctx.snapshot.unwrap();
        assert_eq!(snapshot.identifier, "newer");
        assert!(!snapshot.created_by_run);
        assert!(!ctx.intermediate_snapshot_requested);
    }

    #[tokio::test]
    async fn test_reuse_latest_accepts_automated_snapshots() {
        let (store, mut ctx) = setup(SnapshotMode::ReuseLatest).await;
        let mut control = MockControlPlane::new();
        control
            .expect_describe_instance()
            .returning(|_| Ok(Some(source_instance("postgres", None))));
        control.expect_describe_snapshot().returning(|_| Ok(None));
        control.expect_describe_snapshots().returning(|_| {
            Ok(vec![
                snapshot("prod-db-manual", "available", 3),
                snapshot("rds:prod-db-2024-01-09-05-10", "available", 9),
            ])
        });

        locate_snapshot(&control, &store, &mut ctx, &wait(), &CancellationToken::new())
            .await
            .unwrap();

        let snapshot = ctx.snapshot.unwrap();
        assert_eq!(snapshot.identifier, "rds:prod-db-2024-01-09-05-10");
        assert!(!snapshot.created_by_run);
    }

    #[tokio::test]
    async fn test_reuse_latest_without_snapshots_creates_nothing() {
        let (store, mut ctx) = setup(SnapshotMode::ReuseLatest).await;
        let mut control = MockControlPlane::new();
        control
            .expect_describe_instance()
            .returning(|_| Ok(Some(source_instance("postgres", None))));
        control.expect_describe_snapshot().returning(|_| Ok(None));
        control.expect_describe_snapshots().returning(|_| Ok(vec![]));
        control.expect_create_snapshot().never();
        control.expect_restore_instance().never();

        let err = locate_snapshot(&control, &store, &mut ctx, &wait(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
        assert!(!ctx.has_ephemeral_resources());
    }

    #[tokio::test]
    async fn test_taken_final_name_is_refused_before_provisioning() {
        let (store, mut ctx) = setup(SnapshotMode::CreateNew).await;
        let mut control = MockControlPlane::new();
        control
            .expect_describe_instance()
            .returning(|_| Ok(Some(source_instance("postgres", None))));
        control
            .expect_describe_snapshot()
            .returning(|id| Ok(Some(snapshot(id, "available", 15))));
        control.expect_create_snapshot().never();

        let err = locate_snapshot(&control, &store, &mut ctx, &wait(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)), "{err:?}");
        assert!(!ctx.has_ephemeral_resources());
    }

    #[tokio::test]
    async fn test_unsupported_sources_are_rejected() {
        let mut control = MockControlPlane::new();
        control
            .expect_describe_instance()
            .returning(|_| Ok(Some(source_instance("aurora-postgresql", Some("prod-cluster")))));
        let err = describe_source(&control, "prod-db").await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));

        let mut control = MockControlPlane::new();
        control
            .expect_describe_instance()
            .returning(|_| Ok(Some(source_instance("oracle-ee", None))));
        let err = describe_source(&control, "prod-db").await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));

        let mut control = MockControlPlane::new();
        control.expect_describe_instance().returning(|_| Ok(None));
        let err = describe_source(&control, "prod-db").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_create_new_records_snapshot_before_requesting() {
        let (store, mut ctx) = setup(SnapshotMode::CreateNew).await;
        let snapshot_id = ctx.intermediate_snapshot_id.clone();

        let mut control = MockControlPlane::new();
        control
            .expect_describe_instance()
            .returning(|_| Ok(Some(source_instance("mysql", None))));
        let expected = snapshot_id.clone();
        control
            .expect_create_snapshot()
            .withf(move |req| req.snapshot_id == expected && req.db_instance_id == "prod-db")
            .times(1)
            .returning(|_| Ok(()));
        let final_id = ctx.final_snapshot_id.clone();
        control
            .expect_describe_snapshot()
            .withf(move |id| id == final_id)
            .returning(|_| Ok(None));
        let final_id = ctx.final_snapshot_id.clone();
        let mut polls = 0;
        control
            .expect_describe_snapshot()
            .withf(move |id| id != final_id)
            .returning(move |id| {
                polls += 1;
                let status = if polls < 3 { "creating" } else { "available" };
                Ok(Some(snapshot(id, status, 15)))
            });

        locate_snapshot(&control, &store, &mut ctx, &wait(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(ctx.intermediate_snapshot_requested);
        let located = ctx.snapshot.as_ref().unwrap();
        assert_eq!(located.identifier, snapshot_id);
        assert!(located.created_by_run);

        let resources = crate::state::get_run_resources(store.pool(), ctx.run_id.as_str())
            .await
            .unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].resource_id, snapshot_id);
    }
}
