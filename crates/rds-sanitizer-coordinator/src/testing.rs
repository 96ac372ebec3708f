//! In-memory control plane and sanitizer for end-to-end run tests
//!
//! Resources move through their lifecycle one step per describe call:
//! `creating` becomes `available` and `deleting` becomes gone after a
//! configurable number of polls.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use chrono::Utc;
use rds_sanitizer_common::engine::STATEMENT_MARKER;
use rds_sanitizer_common::tags::TAG_RUN_ID;

use crate::aws::AwsError;
use crate::credential::Credential;
use crate::pipeline::{
    ControlPlane, CreateSnapshotRequest, DbInstanceInfo, Endpoint, RestoreInstanceRequest,
    SanitizationJob, Sanitizer, SnapshotInfo, TaskHandle, TaskStatus,
};

struct Transition {
    polls_left: u32,
}

struct FakeInstance {
    info: DbInstanceInfo,
    transition: Option<Transition>,
    credential_polls_left: Option<u32>,
    credential: Option<String>,
}

struct FakeSnapshot {
    info: SnapshotInfo,
    transition: Option<Transition>,
    shared_with: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    instances: HashMap<String, FakeInstance>,
    snapshots: HashMap<String, FakeSnapshot>,
    /// Every state-changing call, in order
    calls: Vec<String>,
    rejected_accounts: HashSet<String>,
    credential_never_applies: bool,
    undeletable: HashSet<String>,
}

/// Stateful fake of the RDS control plane
pub struct FakeControlPlane {
    state: Mutex<FakeState>,
    polls_per_transition: u32,
}

fn not_found(resource_type: &'static str, id: &str) -> anyhow::Error {
    AwsError::NotFound {
        resource_type,
        resource_id: id.to_string(),
    }
    .into()
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            polls_per_transition: 2,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Add an available source instance
    pub fn with_source(self, id: &str, engine: &str, kms_key_id: Option<&str>) -> Self {
        let info = DbInstanceInfo {
            identifier: id.to_string(),
            engine: engine.to_string(),
            engine_version: None,
            status: "available".to_string(),
            pending_credential_change: false,
            endpoint: Some(Endpoint {
                address: format!("{id}.abc.us-east-2.rds.amazonaws.com"),
                port: 5432,
            }),
            master_username: Some("admin".to_string()),
            db_name: None,
            storage_encrypted: kms_key_id.is_some(),
            kms_key_id: kms_key_id.map(str::to_string),
            cluster_identifier: None,
            tags: vec![],
        };
        self.lock().instances.insert(
            id.to_string(),
            FakeInstance {
                info,
                transition: None,
                credential_polls_left: None,
                credential: None,
            },
        );
        self
    }

    /// Add an available snapshot of `source`
    pub fn with_snapshot(self, id: &str, source: &str, days_ago: i64) -> Self {
        let kms_key_id = self
            .lock()
            .instances
            .get(source)
            .and_then(|i| i.info.kms_key_id.clone());
        let info = SnapshotInfo {
            identifier: id.to_string(),
            source_db: source.to_string(),
            status: "available".to_string(),
            encrypted: kms_key_id.is_some(),
            kms_key_id,
            created_at: Some(Utc::now() - chrono::Duration::days(days_ago)),
            tags: vec![],
        };
        self.lock().snapshots.insert(
            id.to_string(),
            FakeSnapshot {
                info,
                transition: None,
                shared_with: vec![],
            },
        );
        self
    }

    pub fn rejecting_account(self, account: &str) -> Self {
        self.lock().rejected_accounts.insert(account.to_string());
        self
    }

    pub fn credential_never_applies(self) -> Self {
        self.set_credential_applies(false);
        self
    }

    pub fn set_credential_applies(&self, applies: bool) {
        self.lock().credential_never_applies = !applies;
    }

    /// Deletes of resources whose identifier starts with `prefix` are denied
    pub fn undeletable(self, prefix: &str) -> Self {
        self.lock().undeletable.insert(prefix.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn instance_exists(&self, id: &str) -> bool {
        self.lock().instances.contains_key(id)
    }

    pub fn snapshot(&self, id: &str) -> Option<SnapshotInfo> {
        self.lock().snapshots.get(id).map(|s| s.info.clone())
    }

    pub fn shared_with(&self, id: &str) -> Vec<String> {
        self.lock()
            .snapshots
            .get(id)
            .map(|s| s.shared_with.clone())
            .unwrap_or_default()
    }

    /// Number of instances, excluding sources
    pub fn ephemeral_instances(&self) -> usize {
        self.lock()
            .instances
            .values()
            .filter(|i| i.info.tags.iter().any(|(k, _)| k == TAG_RUN_ID))
            .count()
    }

    pub fn credential_of(&self, id: &str) -> Option<String> {
        self.lock().instances.get(id).and_then(|i| i.credential.clone())
    }

    fn is_undeletable(state: &FakeState, id: &str) -> bool {
        state.undeletable.iter().any(|p| id.starts_with(p.as_str()))
    }
}

/// Advance a transition; returns true when it completed on this poll
fn advance(transition: &mut Option<Transition>) -> bool {
    match transition {
        Some(t) if t.polls_left > 1 => {
            t.polls_left -= 1;
            false
        }
        Some(_) => {
            *transition = None;
            true
        }
        None => false,
    }
}

impl ControlPlane for FakeControlPlane {
    async fn describe_instance(&self, instance_id: &str) -> Result<Option<DbInstanceInfo>> {
        let mut state = self.lock();
        let never_applies = state.credential_never_applies;
        let Some(instance) = state.instances.get_mut(instance_id) else {
            return Ok(None);
        };

        if advance(&mut instance.transition) {
            if instance.info.status == "deleting" {
                state.instances.remove(instance_id);
                return Ok(None);
            }
            instance.info.status = "available".to_string();
        }
        if let Some(left) = instance.credential_polls_left.as_mut() {
            if *left > 0 {
                *left -= 1;
                instance.info.status = "resetting-master-credentials".to_string();
            } else if !never_applies {
                instance.credential_polls_left = None;
                instance.info.status = "available".to_string();
                instance.info.pending_credential_change = false;
            }
        }
        Ok(Some(instance.info.clone()))
    }

    async fn describe_snapshots(&self, db_instance_id: &str) -> Result<Vec<SnapshotInfo>> {
        Ok(self
            .lock()
            .snapshots
            .values()
            .filter(|s| s.info.source_db == db_instance_id)
            .map(|s| s.info.clone())
            .collect())
    }

    async fn describe_snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotInfo>> {
        let mut state = self.lock();
        let Some(snapshot) = state.snapshots.get_mut(snapshot_id) else {
            return Ok(None);
        };
        if advance(&mut snapshot.transition) {
            if snapshot.info.status == "deleting" {
                state.snapshots.remove(snapshot_id);
                return Ok(None);
            }
            snapshot.info.status = "available".to_string();
        }
        Ok(Some(snapshot.info.clone()))
    }

    async fn create_snapshot(&self, request: CreateSnapshotRequest) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("create_snapshot {}", request.snapshot_id));
        if state.snapshots.contains_key(&request.snapshot_id) {
            return Err(AwsError::AlreadyExists(request.snapshot_id).into());
        }
        let source = state
            .instances
            .get(&request.db_instance_id)
            .ok_or_else(|| not_found("DB instance", &request.db_instance_id))?;
        let info = SnapshotInfo {
            identifier: request.snapshot_id.clone(),
            source_db: request.db_instance_id.clone(),
            status: "creating".to_string(),
            encrypted: source.info.storage_encrypted,
            kms_key_id: source.info.kms_key_id.clone(),
            created_at: Some(Utc::now()),
            tags: request.tags,
        };
        state.snapshots.insert(
            request.snapshot_id,
            FakeSnapshot {
                info,
                transition: Some(Transition {
                    polls_left: self.polls_per_transition,
                }),
                shared_with: vec![],
            },
        );
        Ok(())
    }

    async fn restore_instance(&self, request: RestoreInstanceRequest) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("restore_instance {}", request.instance_id));
        if state.instances.contains_key(&request.instance_id) {
            return Err(AwsError::AlreadyExists(request.instance_id).into());
        }
        let snapshot = state
            .snapshots
            .get(&request.snapshot_id)
            .ok_or_else(|| not_found("DB snapshot", &request.snapshot_id))?;
        let engine = state
            .instances
            .get(&snapshot.info.source_db)
            .map(|i| i.info.engine.clone())
            .unwrap_or_else(|| "postgres".to_string());
        let info = DbInstanceInfo {
            identifier: request.instance_id.clone(),
            engine,
            engine_version: None,
            status: "creating".to_string(),
            pending_credential_change: false,
            endpoint: Some(Endpoint {
                address: format!("{}.abc.us-east-2.rds.amazonaws.com", request.instance_id),
                port: 5432,
            }),
            master_username: Some("admin".to_string()),
            db_name: None,
            storage_encrypted: snapshot.info.encrypted,
            kms_key_id: snapshot.info.kms_key_id.clone(),
            cluster_identifier: None,
            tags: request.tags,
        };
        state.instances.insert(
            request.instance_id,
            FakeInstance {
                info,
                transition: Some(Transition {
                    polls_left: self.polls_per_transition,
                }),
                credential_polls_left: None,
                credential: None,
            },
        );
        Ok(())
    }

    async fn reset_credential(&self, instance_id: &str, credential: &Credential) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("reset_credential {instance_id}"));
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| not_found("DB instance", instance_id))?;
        instance.info.pending_credential_change = true;
        instance.credential_polls_left = Some(1);
        instance.credential = Some(credential.expose().to_string());
        Ok(())
    }

    async fn share_snapshot(&self, snapshot_id: &str, account: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("share_snapshot {snapshot_id} {account}"));
        if state.rejected_accounts.contains(account) {
            return Err(AwsError::Sdk {
                code: Some("InvalidParameterValue".to_string()),
                message: format!("{account} is not a valid account"),
            }
            .into());
        }
        let snapshot = state
            .snapshots
            .get_mut(snapshot_id)
            .ok_or_else(|| not_found("DB snapshot", snapshot_id))?;
        snapshot.shared_with.push(account.to_string());
        Ok(())
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("delete_instance {instance_id}"));
        if Self::is_undeletable(&state, instance_id) {
            return Err(AwsError::Sdk {
                code: Some("AccessDenied".to_string()),
                message: "not authorized".to_string(),
            }
            .into());
        }
        let polls = self.polls_per_transition;
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| not_found("DB instance", instance_id))?;
        instance.info.status = "deleting".to_string();
        instance.transition = Some(Transition { polls_left: polls });
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(format!("delete_snapshot {snapshot_id}"));
        if Self::is_undeletable(&state, snapshot_id) {
            return Err(AwsError::Sdk {
                code: Some("AccessDenied".to_string()),
                message: "not authorized".to_string(),
            }
            .into());
        }
        let polls = self.polls_per_transition;
        let snapshot = state
            .snapshots
            .get_mut(snapshot_id)
            .ok_or_else(|| not_found("DB snapshot", snapshot_id))?;
        snapshot.info.status = "deleting".to_string();
        snapshot.transition = Some(Transition { polls_left: polls });
        Ok(())
    }
}

#[derive(Default)]
struct SanitizerState {
    jobs: Vec<SanitizationJob>,
    polls: u32,
    stopped: Vec<String>,
}

/// Fake sanitizer that runs for a couple of polls, then exits
pub struct FakeSanitizer {
    state: Mutex<SanitizerState>,
    /// Index of the statement that fails, if any
    fail_at: Option<usize>,
    /// Never finishes
    hangs: bool,
}

impl FakeSanitizer {
    pub fn succeeding() -> Self {
        Self {
            state: Mutex::new(SanitizerState::default()),
            fail_at: None,
            hangs: false,
        }
    }

    pub fn failing_at(index: usize) -> Self {
        Self {
            fail_at: Some(index),
            ..Self::succeeding()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hangs: true,
            ..Self::succeeding()
        }
    }

    pub fn launches(&self) -> usize {
        self.state.lock().unwrap().jobs.len()
    }

    pub fn last_job(&self) -> Option<SanitizationJob> {
        self.state.lock().unwrap().jobs.last().cloned()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().unwrap().stopped.clone()
    }
}

impl Sanitizer for FakeSanitizer {
    async fn launch(&self, job: SanitizationJob) -> Result<TaskHandle> {
        let mut state = self.state.lock().unwrap();
        state.jobs.push(job);
        let n = state.jobs.len();
        Ok(TaskHandle {
            task_arn: format!("arn:aws:ecs:us-east-2:123456789012:task/sanitizer/task{n}"),
            log_stream: Some(format!("sql/sql/task{n}")),
        })
    }

    async fn status(&self, task: &TaskHandle) -> Result<TaskStatus> {
        let mut state = self.state.lock().unwrap();
        if state.stopped.contains(&task.task_arn) {
            return Ok(TaskStatus::Stopped {
                exit_code: None,
                reason: Some("stopped".to_string()),
            });
        }
        state.polls += 1;
        if self.hangs || state.polls < 2 {
            return Ok(TaskStatus::Running);
        }
        Ok(TaskStatus::Stopped {
            exit_code: Some(if self.fail_at.is_some() { 3 } else { 0 }),
            reason: Some("Essential container in task exited".to_string()),
        })
    }

    async fn output(&self, _task: &TaskHandle) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let statements = state.jobs.last().map(|j| j.statements.len()).unwrap_or(0);
        let mut lines = Vec::new();
        for i in 0..statements {
            lines.push(format!("{STATEMENT_MARKER}{i}"));
            if self.fail_at == Some(i) {
                lines.push("ERROR:  relation \"payments\" does not exist".to_string());
                break;
            }
            lines.push("UPDATE 1".to_string());
        }
        Ok(lines)
    }

    async fn stop(&self, task: &TaskHandle, _reason: &str) -> Result<()> {
        self.state.lock().unwrap().stopped.push(task.task_arn.clone());
        Ok(())
    }
}
