//! Run engine: drives a run through its state machine
//!
//! State and context are persisted on every transition, so a run can be
//! picked up again with [`RunEngine::resume`] after the process died at any
//! point. Cleanup runs on every exit path that may have created resources,
//! including cancellation.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rds_sanitizer_common::RunId;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use super::cleanup::cleanup_run;
use super::context::{FinalSnapshot, RunContext};
use super::control_plane::ControlPlane;
use super::error::{Failure, PipelineError};
use super::events::RunEvent;
use super::finalizer::{await_final_snapshot, request_final_snapshot, share_final_snapshot};
use super::locator::locate_snapshot;
use super::provisioner::{
    await_credential_applied, await_instance_ready, provision_instance, reset_credential,
};
use super::run_state::RunState;
use super::sanitizer::{Sanitizer, run_sanitizer};
use crate::config::WaitSettings;
use crate::credential::Credential;
use crate::state::{LockOutcome, RunStore};
use crate::wait::WaitConfig;

/// Another active run holds the source database
#[derive(Debug, Error)]
#[error("source database {source_db} is locked by run {holder} (since {since})")]
pub struct RunLocked {
    pub source_db: String,
    pub holder: String,
    pub since: DateTime<Utc>,
}

/// Final result of a run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub state: RunState,
    pub failure: Option<Failure>,
    pub final_snapshot: Option<FinalSnapshot>,
    pub cleanup_error: Option<String>,
}

impl RunOutcome {
    fn new(ctx: &RunContext, state: RunState) -> Self {
        Self {
            run_id: ctx.run_id.clone(),
            state,
            failure: ctx.failure.clone(),
            final_snapshot: ctx.final_snapshot.clone(),
            cleanup_error: ctx.cleanup_error.clone(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == RunState::Succeeded
    }
}

pub struct RunEngine<'a, C, S> {
    control: &'a C,
    sanitizer: &'a S,
    store: &'a RunStore,
    waits: &'a WaitSettings,
    cancel: CancellationToken,
    /// Held for the lifetime of the run only
    credential: Option<Credential>,
}

impl<'a, C: ControlPlane, S: Sanitizer> RunEngine<'a, C, S> {
    pub fn new(
        control: &'a C,
        sanitizer: &'a S,
        store: &'a RunStore,
        waits: &'a WaitSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            control,
            sanitizer,
            store,
            waits,
            cancel,
            credential: None,
        }
    }

    /// Start a new run and drive it to a terminal state
    ///
    /// Fails with [`RunLocked`] when another run is active on the same
    /// source database; the refused run is recorded as failed.
    #[instrument(skip_all, fields(run_id = %ctx.run_id, source_db = %ctx.inputs.source_db))]
    pub async fn start(&mut self, mut ctx: RunContext) -> Result<RunOutcome> {
        let state = RunState::LocatingSnapshot;
        self.store.insert_run(&ctx, state).await?;
        self.store
            .append_event(
                ctx.run_id.as_str(),
                None,
                state,
                &RunEvent::Started {
                    source_db: &ctx.inputs.source_db,
                    mode: ctx.inputs.mode,
                }
                .to_string(),
            )
            .await?;

        if let Err(locked) = self.lock(&ctx).await? {
            let failure = Failure::new(state, &PipelineError::InvalidInput(locked.to_string()));
            self.store
                .append_event(
                    ctx.run_id.as_str(),
                    Some(state),
                    RunState::Failed,
                    &RunEvent::StepFailed(&failure).to_string(),
                )
                .await?;
            ctx.failure = Some(failure);
            self.store.save_run(&ctx, RunState::Failed).await?;
            return Err(locked.into());
        }

        info!(
            mode = %ctx.inputs.mode,
            instance = %ctx.instance_id,
            final_snapshot = %ctx.final_snapshot_id,
            "Run started"
        );
        self.drive(ctx, state).await
    }

    /// Continue a persisted run from the state it was left in
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn resume(&mut self, run_id: &str) -> Result<RunOutcome> {
        let stored = self
            .store
            .load_run(run_id)
            .await?
            .with_context(|| format!("Run {run_id} not found"))?;
        let mut state = stored.record.state;
        let mut ctx = stored.context;

        if state.is_terminal() {
            info!(state = %state, "Run already finished");
            return Ok(RunOutcome::new(&ctx, state));
        }

        if let Err(locked) = self.lock(&ctx).await? {
            return Err(locked.into());
        }
        self.store
            .append_event(run_id, Some(state), state, &RunEvent::Resumed.to_string())
            .await?;
        info!(state = %state, "Resuming run");

        let needs_credential = matches!(
            state,
            RunState::AwaitingCredentialApplied | RunState::Sanitizing
        ) && ctx.sanitizer_task.is_none()
            && self.credential.is_none();
        if needs_credential {
            ctx.credential_issued_at = None;
            let next = RunState::ResettingCredential;
            self.transition(&mut ctx, state, next, RunEvent::CredentialReissued)
                .await?;
            state = next;
        }

        self.drive(ctx, state).await
    }

    async fn lock(&self, ctx: &RunContext) -> Result<Result<(), RunLocked>> {
        let source_db = &ctx.inputs.source_db;
        match self.store.acquire_lock(source_db, ctx.run_id.as_str()).await? {
            LockOutcome::Acquired => Ok(Ok(())),
            LockOutcome::Held {
                run_id,
                acquired_at,
            } => Ok(Err(RunLocked {
                source_db: source_db.clone(),
                holder: run_id,
                since: acquired_at,
            })),
        }
    }

    /// Drive the run to a terminal state, then release its lock
    ///
    /// A transition that cannot be persisted ends the run with that error.
    /// Its ephemeral resources are then removed from what is known in
    /// memory, and the lock is released, but the stored state stays where
    /// it was; a later resume finds the resources already gone.
    async fn drive(&mut self, mut ctx: RunContext, state: RunState) -> Result<RunOutcome> {
        let result = self.advance(&mut ctx, state).await;
        self.credential = None;

        if let Err(e) = &result {
            error!(error = %e, "Run state could not be persisted; abandoning run");
            if ctx.has_ephemeral_resources() {
                let wait = self.waits.cleanup();
                match cleanup_run(self.control, self.store, &ctx, &wait).await {
                    Ok(_) => info!("Ephemeral resources of abandoned run removed"),
                    Err(cleanup) => error!(
                        error = %cleanup,
                        "Abandoned run left ephemeral resources behind; run cleanup-orphans"
                    ),
                }
            }
        }
        if let Err(e) = self
            .store
            .release_lock(&ctx.inputs.source_db, ctx.run_id.as_str())
            .await
        {
            warn!(error = %e, "Failed to release run lock");
        }
        let state = result?;

        let outcome = RunOutcome::new(&ctx, state);
        match state {
            RunState::Succeeded => info!(
                final_snapshot = ?outcome.final_snapshot.as_ref().map(|s| &s.identifier),
                "Run succeeded"
            ),
            RunState::CleanupFailed => error!(
                detail = ?outcome.cleanup_error,
                "Run left ephemeral resources behind; operator action required"
            ),
            _ => warn!(
                failure = ?outcome.failure.as_ref().map(|f| &f.message),
                "Run failed"
            ),
        }
        Ok(outcome)
    }

    /// Step through states until a terminal one is reached and persisted
    async fn advance(&mut self, ctx: &mut RunContext, mut state: RunState) -> Result<RunState> {
        while !state.is_terminal() {
            let wait = self.waits.for_state(state, ctx.step_started_at);

            if state == RunState::CleaningUp {
                let run_failed = ctx.failure.is_some();
                let (next, result) = match cleanup_run(self.control, self.store, ctx, &wait).await {
                    Ok(report) => (
                        RunState::after_cleanup(run_failed, true),
                        RunEvent::CleanupFinished(&report).to_string(),
                    ),
                    Err(e) => {
                        let message = match &e {
                            PipelineError::CleanupFailed { detail, .. } => format!("{e}: {detail}"),
                            _ => e.to_string(),
                        };
                        error!(error = %message, "Cleanup failed, ephemeral resources remain");
                        let event = RunEvent::CleanupFailed(&message).to_string();
                        ctx.cleanup_error = Some(message);
                        (RunState::after_cleanup(run_failed, false), event)
                    }
                };
                self.transition_with(ctx, state, next, &result).await?;
                state = next;
                continue;
            }

            let result = if self.cancel.is_cancelled() {
                Err(PipelineError::Cancelled)
            } else {
                self.step(state, ctx, &wait).await
            };

            let next = match result {
                Ok(()) => {
                    self.transition(ctx, state, state.successor(), RunEvent::StepCompleted)
                        .await?;
                    state.successor()
                }
                Err(e) => {
                    error!(state = %state, kind = %e.kind(), error = %e, "Step failed");
                    let failure = Failure::new(state, &e);
                    let next = state.on_failure(ctx.has_ephemeral_resources());
                    let message = RunEvent::StepFailed(&failure).to_string();
                    ctx.failure = Some(failure);
                    self.transition_with(ctx, state, next, &message).await?;
                    next
                }
            };
            state = next;
        }
        Ok(state)
    }

    async fn step(
        &mut self,
        state: RunState,
        ctx: &mut RunContext,
        wait: &WaitConfig,
    ) -> Result<(), PipelineError> {
        let (control, store, cancel) = (self.control, self.store, &self.cancel);
        match state {
            RunState::LocatingSnapshot => locate_snapshot(control, store, ctx, wait, cancel).await,
            RunState::ProvisioningInstance => provision_instance(control, store, ctx).await,
            RunState::AwaitingInstanceReady => {
                await_instance_ready(control, store, ctx, wait, cancel).await
            }
            RunState::ResettingCredential => {
                self.credential = Some(reset_credential(control, store, ctx).await?);
                Ok(())
            }
            RunState::AwaitingCredentialApplied => {
                await_credential_applied(control, ctx, wait, self.waits.credential_settle, cancel)
                    .await
            }
            RunState::Sanitizing => {
                run_sanitizer(
                    self.sanitizer,
                    store,
                    ctx,
                    self.credential.as_ref(),
                    wait,
                    cancel,
                )
                .await
            }
            RunState::FinalizingSnapshot => request_final_snapshot(control, store, ctx).await,
            RunState::AwaitingFinalSnapshot => {
                await_final_snapshot(control, store, ctx, wait, cancel).await
            }
            RunState::Sharing => share_final_snapshot(control, store, ctx).await,
            RunState::CleaningUp
            | RunState::Succeeded
            | RunState::Failed
            | RunState::CleanupFailed => Ok(()),
        }
    }

    async fn transition(
        &self,
        ctx: &mut RunContext,
        from: RunState,
        to: RunState,
        event: RunEvent<'_>,
    ) -> Result<()> {
        self.transition_with(ctx, from, to, &event.to_string()).await
    }

    async fn transition_with(
        &self,
        ctx: &mut RunContext,
        from: RunState,
        to: RunState,
        message: &str,
    ) -> Result<()> {
        ctx.step_started_at = Utc::now();
        self.store.save_run(ctx, to).await?;
        self.store
            .append_event(ctx.run_id.as_str(), Some(from), to, message)
            .await?;
        info!(run_id = %ctx.run_id, from = %from, to = %to, "Run state changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rds_sanitizer_common::SnapshotNameFormat;

    use super::*;
    use crate::pipeline::context::test_inputs;
    use crate::pipeline::error::FailureKind;
    use crate::pipeline::sanitizer::{SanitizationJob, TaskHandle, TaskStatus};
    use crate::pipeline::{RunInputs, SnapshotMode};
    use crate::testing::{FakeControlPlane, FakeSanitizer};
    use rds_sanitizer_common::ResourceKind;

    const KEY: &str = "arn:aws:kms:us-east-2:123456789012:key/source";

    fn waits() -> WaitSettings {
        WaitSettings {
            poll_interval: Duration::from_millis(1),
            max_poll_interval: Duration::from_millis(5),
            snapshot_timeout: Duration::from_secs(5),
            instance_timeout: Duration::from_secs(5),
            sanitize_timeout: Duration::from_secs(5),
            cleanup_timeout: Duration::from_secs(5),
            credential_settle: Duration::from_millis(50),
            jitter: false,
        }
    }

    fn context(inputs: RunInputs) -> RunContext {
        let format: SnapshotNameFormat = inputs.name_format.parse().unwrap();
        RunContext::new(inputs, &format).unwrap()
    }

    fn control() -> FakeControlPlane {
        FakeControlPlane::new().with_source("prod-db", "postgres", Some(KEY))
    }

    async fn run(
        control: &FakeControlPlane,
        sanitizer: &FakeSanitizer,
        store: &RunStore,
        waits: &WaitSettings,
        ctx: RunContext,
    ) -> RunOutcome {
        RunEngine::new(control, sanitizer, store, waits, CancellationToken::new())
            .start(ctx)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_new_run_succeeds_and_cleans_up() {
        let store = RunStore::open_test().await.unwrap();
        let control = control();
        let sanitizer = FakeSanitizer::succeeding();
        let ctx = context(test_inputs("prod-db", SnapshotMode::CreateNew));
        let (run_id, instance, intermediate, final_id) = (
            ctx.run_id.clone(),
            ctx.instance_id.clone(),
            ctx.intermediate_snapshot_id.clone(),
            ctx.final_snapshot_id.clone(),
        );

        let outcome = run(&control, &sanitizer, &store, &waits(), ctx).await;

        assert!(outcome.succeeded(), "{outcome:?}");
        assert_eq!(
            final_id,
            format!("sanitized-{}", Utc::now().format("%Y-%m-%d"))
        );
        let final_snapshot = outcome.final_snapshot.unwrap();
        assert_eq!(final_snapshot.identifier, final_id);
        assert_eq!(final_snapshot.kms_key_id.as_deref(), Some(KEY));
        assert_eq!(final_snapshot.shared_with, vec!["111111111111"]);

        // One source snapshot, one instance, one final snapshot
        assert_eq!(control.count_calls("create_snapshot"), 2);
        assert_eq!(control.count_calls("restore_instance"), 1);
        assert_eq!(control.count_calls(&format!("delete_instance {instance}")), 1);
        assert_eq!(control.count_calls(&format!("delete_snapshot {intermediate}")), 1);
        assert!(!control.instance_exists(&instance));
        assert!(control.snapshot(&intermediate).is_none());
        assert_eq!(control.shared_with(&final_id), vec!["111111111111"]);

        let job = sanitizer.last_job().unwrap();
        assert_eq!(job.statements.len(), 2);
        assert_eq!(job.connection.host, format!("{instance}.abc.us-east-2.rds.amazonaws.com"));

        let stored = store.load_run(run_id.as_str()).await.unwrap().unwrap();
        assert_eq!(stored.record.state, RunState::Succeeded);
        assert!(stored.record.finished_at.is_some());
        let remaining = crate::state::get_undeleted_resources(store.pool()).await.unwrap();
        assert!(remaining.is_empty(), "{remaining:?}");

        // Lock released
        let other = context(test_inputs("prod-db", SnapshotMode::CreateNew));
        store.insert_run(&other, RunState::LocatingSnapshot).await.unwrap();
        assert_eq!(
            store.acquire_lock("prod-db", other.run_id.as_str()).await.unwrap(),
            LockOutcome::Acquired
        );
    }

    #[tokio::test]
    async fn test_second_cleanup_is_a_no_op() {
        let store = RunStore::open_test().await.unwrap();
        let control = control();
        let sanitizer = FakeSanitizer::succeeding();
        let ctx = context(test_inputs("prod-db", SnapshotMode::CreateNew));
        let run_id = ctx.run_id.clone();

        let outcome = run(&control, &sanitizer, &store, &waits(), ctx).await;
        assert!(outcome.succeeded());

        let stored = store.load_run(run_id.as_str()).await.unwrap().unwrap();
        let deletes = control.count_calls("delete_");
        let report = cleanup_run(&control, &store, &stored.context, &waits().cleanup())
            .await
            .unwrap();
        assert_eq!(control.count_calls("delete_"), deletes);
        assert!(
            report
                .removed
                .iter()
                .all(|(_, _, outcome)| *outcome == crate::pipeline::DeleteOutcome::AlreadyGone)
        );
    }

    #[tokio::test]
    async fn test_reuse_latest_restores_newest_snapshot() {
        let store = RunStore::open_test().await.unwrap();
        let control = control()
            .with_snapshot("prod-db-old", "prod-db", 7)
            .with_snapshot("prod-db-new", "prod-db", 1);
        let sanitizer = FakeSanitizer::succeeding();
        let ctx = context(test_inputs("prod-db", SnapshotMode::ReuseLatest));

        let outcome = run(&control, &sanitizer, &store, &waits(), ctx).await;

        assert!(outcome.succeeded(), "{outcome:?}");
        assert_eq!(control.count_calls("create_snapshot"), 1, "final snapshot only");
        assert_eq!(control.count_calls("delete_snapshot"), 0);
        assert!(control.snapshot("prod-db-new").is_some());
        assert!(control.snapshot("prod-db-old").is_some());
    }

    #[tokio::test]
    async fn test_reuse_latest_without_snapshot_creates_nothing() {
        let store = RunStore::open_test().await.unwrap();
        let control = control();
        let sanitizer = FakeSanitizer::succeeding();
        let ctx = context(test_inputs("prod-db", SnapshotMode::ReuseLatest));

        let outcome = run(&control, &sanitizer, &store, &waits(), ctx).await;

        assert_eq!(outcome.state, RunState::Failed);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::NotFound);
        assert_eq!(failure.step, RunState::LocatingSnapshot);
        assert!(control.calls().is_empty(), "{:?}", control.calls());
        assert_eq!(sanitizer.launches(), 0);
    }

    #[tokio::test]
    async fn test_sanitization_failure_produces_no_final_snapshot() {
        let store = RunStore::open_test().await.unwrap();
        let control = control();
        let sanitizer = FakeSanitizer::failing_at(1);
        let ctx = context(test_inputs("prod-db", SnapshotMode::CreateNew));
        let (instance, final_id) = (ctx.instance_id.clone(), ctx.final_snapshot_id.clone());

        let outcome = run(&control, &sanitizer, &store, &waits(), ctx).await;

        assert_eq!(outcome.state, RunState::Failed);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::SanitizationFailed);
        assert_eq!(failure.step, RunState::Sanitizing);
        assert_eq!(failure.statement_index, Some(1));
        assert!(failure.message.contains("payments"), "{}", failure.message);

        assert!(outcome.final_snapshot.is_none());
        assert!(control.snapshot(&final_id).is_none());
        assert!(!control.instance_exists(&instance));
    }

    #[tokio::test]
    async fn test_partial_sharing_keeps_final_snapshot() {
        let store = RunStore::open_test().await.unwrap();
        let control = control().rejecting_account("333333333333");
        let sanitizer = FakeSanitizer::succeeding();
        let mut inputs = test_inputs("prod-db", SnapshotMode::CreateNew);
        inputs.share_accounts = vec![
            "111111111111".to_string(),
            "222222222222".to_string(),
            "333333333333".to_string(),
        ];
        let ctx = context(inputs);
        let (instance, final_id) = (ctx.instance_id.clone(), ctx.final_snapshot_id.clone());

        let outcome = run(&control, &sanitizer, &store, &waits(), ctx).await;

        assert_eq!(outcome.state, RunState::Failed);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::SharingFailed);
        assert_eq!(failure.failed_accounts.len(), 1);
        assert_eq!(failure.failed_accounts[0].account, "333333333333");

        assert!(control.snapshot(&final_id).is_some());
        assert_eq!(control.count_calls(&format!("delete_snapshot {final_id}")), 0);
        assert_eq!(
            control.shared_with(&final_id),
            vec!["111111111111", "222222222222"]
        );
        assert!(!control.instance_exists(&instance));
    }

    #[tokio::test]
    async fn test_credential_never_applied_times_out_and_cleans_up() {
        let store = RunStore::open_test().await.unwrap();
        let control = control().credential_never_applies();
        let sanitizer = FakeSanitizer::succeeding();
        let waits = WaitSettings {
            instance_timeout: Duration::from_millis(300),
            ..waits()
        };
        let ctx = context(test_inputs("prod-db", SnapshotMode::CreateNew));
        let instance = ctx.instance_id.clone();

        let outcome = run(&control, &sanitizer, &store, &waits, ctx).await;

        assert_eq!(outcome.state, RunState::Failed);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert_eq!(failure.step, RunState::AwaitingCredentialApplied);
        assert!(!control.instance_exists(&instance));
        assert_eq!(sanitizer.launches(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_still_cleans_up() {
        let store = RunStore::open_test().await.unwrap();
        let control = control();
        let sanitizer = FakeSanitizer::hanging();
        let waits = waits();
        let cancel = CancellationToken::new();
        let ctx = context(test_inputs("prod-db", SnapshotMode::CreateNew));
        let (instance, intermediate) = (ctx.instance_id.clone(), ctx.intermediate_snapshot_id.clone());

        let mut engine = RunEngine::new(&control, &sanitizer, &store, &waits, cancel.clone());
        let (outcome, ()) = tokio::join!(engine.start(ctx), async {
            while sanitizer.launches() == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            cancel.cancel();
        });
        let outcome = outcome.unwrap();

        assert_eq!(outcome.state, RunState::Failed);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::Cancelled);
        assert_eq!(failure.step, RunState::Sanitizing);
        assert_eq!(sanitizer.stopped().len(), 1, "sanitizer task must be stopped");
        assert!(!control.instance_exists(&instance));
        assert!(control.snapshot(&intermediate).is_none());
    }

    #[tokio::test]
    async fn test_locked_source_refuses_run() {
        let store = RunStore::open_test().await.unwrap();
        let control = control();
        let sanitizer = FakeSanitizer::succeeding();
        let waits = waits();

        let holder = context(test_inputs("prod-db", SnapshotMode::CreateNew));
        store.insert_run(&holder, RunState::Sanitizing).await.unwrap();
        store
            .acquire_lock("prod-db", holder.run_id.as_str())
            .await
            .unwrap();

        let ctx = context(test_inputs("prod-db", SnapshotMode::CreateNew));
        let run_id = ctx.run_id.clone();
        let err = RunEngine::new(&control, &sanitizer, &store, &waits, CancellationToken::new())
            .start(ctx)
            .await
            .unwrap_err();

        let locked = err.downcast_ref::<RunLocked>().unwrap();
        assert_eq!(locked.holder, holder.run_id.as_str());
        assert!(control.calls().is_empty());

        let stored = store.load_run(run_id.as_str()).await.unwrap().unwrap();
        assert_eq!(stored.record.state, RunState::Failed);
        assert_eq!(stored.record.failure_kind.as_deref(), Some("invalid-input"));
    }

    #[tokio::test]
    async fn test_resume_reissues_credential() {
        let store = RunStore::open_test().await.unwrap();
        let control = control().credential_never_applies();
        let sanitizer = FakeSanitizer::succeeding();
        let waits = waits();
        let ctx = context(test_inputs("prod-db", SnapshotMode::CreateNew));
        let (run_id, instance) = (ctx.run_id.clone(), ctx.instance_id.clone());

        // Stop driving the run while it waits for the credential, as if the
        // process had died
        {
            let mut engine =
                RunEngine::new(&control, &sanitizer, &store, &waits, CancellationToken::new());
            tokio::select! {
                _ = engine.start(ctx) => panic!("run should not finish"),
                _ = async {
                    loop {
                        let stored = store.load_run(run_id.as_str()).await.unwrap().unwrap();
                        if stored.record.state == RunState::AwaitingCredentialApplied {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                } => {}
            }
        }
        let first_credential = control.credential_of(&instance).unwrap();
        control.set_credential_applies(true);

        let outcome = RunEngine::new(&control, &sanitizer, &store, &waits, CancellationToken::new())
            .resume(run_id.as_str())
            .await
            .unwrap();

        assert!(outcome.succeeded(), "{outcome:?}");
        assert_eq!(control.count_calls("reset_credential"), 2);
        assert_eq!(control.count_calls("restore_instance"), 1);
        let job = sanitizer.last_job().unwrap();
        assert_ne!(job.credential.expose(), first_credential);

        let events = crate::state::get_run_events(store.pool(), run_id.as_str())
            .await
            .unwrap();
        assert!(events.iter().any(|e| e.message == RunEvent::Resumed.to_string()));
        assert!(
            events
                .iter()
                .any(|e| e.message == RunEvent::CredentialReissued.to_string())
        );
    }

    #[tokio::test]
    async fn test_resume_of_finished_run_is_a_no_op() {
        let store = RunStore::open_test().await.unwrap();
        let control = control();
        let sanitizer = FakeSanitizer::succeeding();
        let ctx = context(test_inputs("prod-db", SnapshotMode::CreateNew));
        let run_id = ctx.run_id.clone();
        run(&control, &sanitizer, &store, &waits(), ctx).await;
        let calls = control.calls().len();

        let outcome = RunEngine::new(&control, &sanitizer, &store, &waits(), CancellationToken::new())
            .resume(run_id.as_str())
            .await
            .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(control.calls().len(), calls);
    }

    #[tokio::test]
    async fn test_cleanup_failure_is_escalated() {
        let store = RunStore::open_test().await.unwrap();
        let sanitizer = FakeSanitizer::succeeding();
        let ctx = context(test_inputs("prod-db", SnapshotMode::CreateNew));
        let (instance, intermediate) = (ctx.instance_id.clone(), ctx.intermediate_snapshot_id.clone());
        let control = control().undeletable(&instance);

        let outcome = run(&control, &sanitizer, &store, &waits(), ctx).await;

        assert_eq!(outcome.state, RunState::CleanupFailed);
        assert!(outcome.failure.is_none(), "the pipeline itself succeeded");
        let detail = outcome.cleanup_error.unwrap();
        assert!(detail.contains(&instance), "{detail}");
        assert!(control.instance_exists(&instance));
        assert!(control.snapshot(&intermediate).is_none(), "other resources still removed");
        assert!(outcome.final_snapshot.is_some());

        let remaining = crate::state::get_undeleted_resources(store.pool()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].resource_id, instance);
    }

    #[tokio::test]
    async fn test_resumed_cleanup_gets_full_budget() {
        let store = RunStore::open_test().await.unwrap();
        let mut ctx = context(test_inputs("prod-db", SnapshotMode::CreateNew));
        let (run_id, intermediate) = (ctx.run_id.clone(), ctx.intermediate_snapshot_id.clone());
        let control = control().with_snapshot(&intermediate, "prod-db", 0);
        let sanitizer = FakeSanitizer::succeeding();

        // Crashed mid-cleanup long before the cleanup timeout
        ctx.intermediate_snapshot_requested = true;
        ctx.failure = Some(Failure::new(RunState::Sanitizing, &PipelineError::Cancelled));
        ctx.step_started_at = Utc::now() - chrono::Duration::hours(3);
        store.insert_run(&ctx, RunState::CleaningUp).await.unwrap();
        store
            .record_resource(run_id.as_str(), ResourceKind::DbSnapshot, &intermediate)
            .await
            .unwrap();

        let outcome = RunEngine::new(&control, &sanitizer, &store, &waits(), CancellationToken::new())
            .resume(run_id.as_str())
            .await
            .unwrap();

        assert_eq!(outcome.state, RunState::Failed, "{:?}", outcome.cleanup_error);
        assert!(outcome.cleanup_error.is_none());
        assert!(control.snapshot(&intermediate).is_none());
    }

    #[tokio::test]
    async fn test_taken_final_name_fails_before_provisioning() {
        let store = RunStore::open_test().await.unwrap();
        let control = control();
        let sanitizer = FakeSanitizer::succeeding();

        let first = run(
            &control,
            &sanitizer,
            &store,
            &waits(),
            context(test_inputs("prod-db", SnapshotMode::CreateNew)),
        )
        .await;
        assert!(first.succeeded());

        // Same name format, same day
        let outcome = run(
            &control,
            &sanitizer,
            &store,
            &waits(),
            context(test_inputs("prod-db", SnapshotMode::CreateNew)),
        )
        .await;

        assert_eq!(outcome.state, RunState::Failed);
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.step, RunState::LocatingSnapshot);
        assert_eq!(failure.kind, FailureKind::InvalidInput);
        assert_eq!(control.count_calls("restore_instance"), 1);
        assert_eq!(control.count_calls("create_snapshot"), 2, "first run only");
        assert_eq!(sanitizer.launches(), 1);
    }

    /// Loses the event table as soon as the sanitizer is launched
    struct EventLogLost<'a> {
        inner: FakeSanitizer,
        store: &'a RunStore,
    }

    impl Sanitizer for EventLogLost<'_> {
        async fn launch(&self, job: SanitizationJob) -> Result<TaskHandle> {
            sqlx::query("DROP TABLE run_events")
                .execute(self.store.pool())
                .await?;
            self.inner.launch(job).await
        }

        async fn status(&self, task: &TaskHandle) -> Result<TaskStatus> {
            self.inner.status(task).await
        }

        async fn output(&self, task: &TaskHandle) -> Result<Vec<String>> {
            self.inner.output(task).await
        }

        async fn stop(&self, task: &TaskHandle, reason: &str) -> Result<()> {
            self.inner.stop(task, reason).await
        }
    }

    #[tokio::test]
    async fn test_unpersistable_run_still_cleans_up_and_unlocks() {
        let store = RunStore::open_test().await.unwrap();
        let control = control();
        let sanitizer = EventLogLost {
            inner: FakeSanitizer::succeeding(),
            store: &store,
        };
        let ctx = context(test_inputs("prod-db", SnapshotMode::CreateNew));
        let (instance, intermediate) = (ctx.instance_id.clone(), ctx.intermediate_snapshot_id.clone());

        let result = RunEngine::new(&control, &sanitizer, &store, &waits(), CancellationToken::new())
            .start(ctx)
            .await;

        assert!(result.is_err());
        assert!(!control.instance_exists(&instance));
        assert!(control.snapshot(&intermediate).is_none());

        let other = context(test_inputs("prod-db", SnapshotMode::CreateNew));
        store.insert_run(&other, RunState::LocatingSnapshot).await.unwrap();
        assert_eq!(
            store.acquire_lock("prod-db", other.run_id.as_str()).await.unwrap(),
            LockOutcome::Acquired
        );
    }
}
