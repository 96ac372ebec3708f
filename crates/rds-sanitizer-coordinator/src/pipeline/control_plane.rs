//! The managed-database control plane as seen by the pipeline

use anyhow::Result;

use super::types::{CreateSnapshotRequest, DbInstanceInfo, RestoreInstanceRequest, SnapshotInfo};
use crate::credential::Credential;

/// Control-plane operations the pipeline needs.
///
/// Implemented against RDS by [`crate::aws::RdsClient`]; mocked in tests.
/// Errors carry an [`crate::aws::AwsError`] in their chain where the cause
/// is classifiable, so callers can tell "already exists" and "not found"
/// apart from real failures.
#[allow(async_fn_in_trait)] // Internal use only
#[cfg_attr(test, mockall::automock)]
pub trait ControlPlane {
    /// Describe a database instance; `None` when it does not exist
    async fn describe_instance(&self, instance_id: &str) -> Result<Option<DbInstanceInfo>>;

    /// Snapshots taken from `db_instance_id`, automated backups included
    async fn describe_snapshots(&self, db_instance_id: &str) -> Result<Vec<SnapshotInfo>>;

    /// Describe one manual snapshot; `None` when it does not exist
    async fn describe_snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotInfo>>;

    async fn create_snapshot(&self, request: CreateSnapshotRequest) -> Result<()>;

    /// Restore a new, privately reachable instance from a snapshot
    async fn restore_instance(&self, request: RestoreInstanceRequest) -> Result<()>;

    /// Set the master credential of an instance, applied immediately
    async fn reset_credential(&self, instance_id: &str, credential: &Credential) -> Result<()>;

    /// Grant `account` restore access to a manual snapshot
    async fn share_snapshot(&self, snapshot_id: &str, account: &str) -> Result<()>;

    /// Delete an instance without a final snapshot or retained backups
    async fn delete_instance(&self, instance_id: &str) -> Result<()>;

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;
}
