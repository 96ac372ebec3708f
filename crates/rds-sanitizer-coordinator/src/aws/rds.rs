//! RDS control-plane client
//!
//! Every request is retried with backoff on throttling; classification of
//! everything else is left to the caller via
//! [`classify_anyhow_error`](super::classify_anyhow_error).

use anyhow::{Context, Result};
use aws_sdk_rds::types::{DbInstance, DbSnapshot};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::context::{AwsContext, FromAwsContext};
use super::error::{is_not_found, is_retryable};
use super::retry::{is_retryable_modify_error, send_with_retry};
use super::tags::{from_rds_tags, rds_tags};
use crate::credential::Credential;
use crate::pipeline::{
    ControlPlane, CreateSnapshotRequest, DbInstanceInfo, Endpoint, RestoreInstanceRequest,
    SnapshotInfo,
};

/// Snapshot attribute that grants restore access to other accounts
const RESTORE_ATTRIBUTE: &str = "restore";

fn to_chrono(dt: &aws_sdk_rds::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

pub(crate) fn instance_info(instance: &DbInstance) -> DbInstanceInfo {
    let pending_credential_change = instance.pending_modified_values().is_some_and(|p| {
        p.master_user_password().is_some() || p.backup_retention_period().is_some()
    });
    let endpoint = instance.endpoint().and_then(|e| {
        Some(Endpoint {
            address: e.address()?.to_string(),
            port: u16::try_from(e.port()?).ok()?,
        })
    });

    DbInstanceInfo {
        identifier: instance.db_instance_identifier().unwrap_or_default().to_string(),
        engine: instance.engine().unwrap_or_default().to_string(),
        engine_version: instance.engine_version().map(str::to_string),
        status: instance.db_instance_status().unwrap_or_default().to_string(),
        pending_credential_change,
        endpoint,
        master_username: instance.master_username().map(str::to_string),
        db_name: instance.db_name().map(str::to_string),
        storage_encrypted: instance.storage_encrypted().unwrap_or(false),
        kms_key_id: instance.kms_key_id().map(str::to_string),
        cluster_identifier: instance.db_cluster_identifier().map(str::to_string),
        tags: from_rds_tags(instance.tag_list()),
    }
}

pub(crate) fn snapshot_info(snapshot: &DbSnapshot) -> SnapshotInfo {
    SnapshotInfo {
        identifier: snapshot.db_snapshot_identifier().unwrap_or_default().to_string(),
        source_db: snapshot.db_instance_identifier().unwrap_or_default().to_string(),
        status: snapshot.status().unwrap_or_default().to_string(),
        encrypted: snapshot.encrypted().unwrap_or(false),
        kms_key_id: snapshot.kms_key_id().map(str::to_string),
        created_at: snapshot.snapshot_create_time().and_then(to_chrono),
        tags: from_rds_tags(snapshot.tag_list()),
    }
}

/// Which snapshots a `DescribeDBSnapshots` listing asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnapshotFilter<'a> {
    /// Every snapshot of one instance, automated backups included
    Source(&'a str),
    /// One snapshot this tool created
    Id(&'a str),
    /// Every manual snapshot in the region
    AllManual,
}

impl<'a> SnapshotFilter<'a> {
    fn instance(self) -> Option<&'a str> {
        match self {
            SnapshotFilter::Source(id) => Some(id),
            _ => None,
        }
    }

    fn snapshot(self) -> Option<&'a str> {
        match self {
            SnapshotFilter::Id(id) => Some(id),
            _ => None,
        }
    }

    /// `None` lists manual and automated snapshots alike
    fn snapshot_type(self) -> Option<&'static str> {
        match self {
            SnapshotFilter::Source(_) => None,
            SnapshotFilter::Id(_) | SnapshotFilter::AllManual => Some("manual"),
        }
    }
}

/// RDS client wrapper
#[derive(Clone)]
pub struct RdsClient {
    client: aws_sdk_rds::Client,
}

impl FromAwsContext for RdsClient {
    fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.rds_client(),
        }
    }
}

impl RdsClient {
    /// Snapshots matching `filter`, following pagination
    async fn list_snapshots(&self, filter: SnapshotFilter<'_>) -> Result<Vec<DbSnapshot>> {
        let mut snapshots = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let page = send_with_retry(
                "DescribeDBSnapshots",
                || async {
                    self.client
                        .describe_db_snapshots()
                        .set_db_instance_identifier(filter.instance().map(str::to_string))
                        .set_db_snapshot_identifier(filter.snapshot().map(str::to_string))
                        .set_snapshot_type(filter.snapshot_type().map(str::to_string))
                        .set_marker(marker.clone())
                        .send()
                        .await
                        .context("Failed to describe DB snapshots")
                },
                is_retryable,
            )
            .await?;

            snapshots.extend(page.db_snapshots().iter().cloned());
            match page.marker() {
                Some(m) if !m.is_empty() => marker = Some(m.to_string()),
                _ => break,
            }
        }

        Ok(snapshots)
    }

    /// All instances in the region, across all pages
    pub async fn list_instances(&self) -> Result<Vec<DbInstanceInfo>> {
        let mut instances = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let page = send_with_retry(
                "DescribeDBInstances",
                || async {
                    self.client
                        .describe_db_instances()
                        .set_marker(marker.clone())
                        .send()
                        .await
                        .context("Failed to describe DB instances")
                },
                is_retryable,
            )
            .await?;

            instances.extend(page.db_instances().iter().map(instance_info));
            match page.marker() {
                Some(m) if !m.is_empty() => marker = Some(m.to_string()),
                _ => break,
            }
        }

        Ok(instances)
    }

    /// All manual snapshots in the region
    pub async fn list_all_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        Ok(self
            .list_snapshots(SnapshotFilter::AllManual)
            .await?
            .iter()
            .map(snapshot_info)
            .collect())
    }
}

impl ControlPlane for RdsClient {
    async fn describe_instance(&self, instance_id: &str) -> Result<Option<DbInstanceInfo>> {
        let result = send_with_retry(
            "DescribeDBInstances",
            || async {
                self.client
                    .describe_db_instances()
                    .db_instance_identifier(instance_id)
                    .send()
                    .await
                    .with_context(|| format!("Failed to describe DB instance {instance_id}"))
            },
            is_retryable,
        )
        .await;

        match result {
            Ok(output) => Ok(output.db_instances().first().map(instance_info)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn describe_snapshots(&self, db_instance_id: &str) -> Result<Vec<SnapshotInfo>> {
        let snapshots = self.list_snapshots(SnapshotFilter::Source(db_instance_id)).await?;
        debug!(db_instance_id, count = snapshots.len(), "Listed snapshots");
        Ok(snapshots.iter().map(snapshot_info).collect())
    }

    async fn describe_snapshot(&self, snapshot_id: &str) -> Result<Option<SnapshotInfo>> {
        match self.list_snapshots(SnapshotFilter::Id(snapshot_id)).await {
            Ok(snapshots) => Ok(snapshots.first().map(snapshot_info)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_snapshot(&self, request: CreateSnapshotRequest) -> Result<()> {
        info!(
            snapshot = %request.snapshot_id,
            db_instance = %request.db_instance_id,
            "Creating DB snapshot"
        );
        send_with_retry(
            "CreateDBSnapshot",
            || async {
                self.client
                    .create_db_snapshot()
                    .db_snapshot_identifier(&request.snapshot_id)
                    .db_instance_identifier(&request.db_instance_id)
                    .set_tags(Some(rds_tags(&request.tags)))
                    .send()
                    .await
                    .with_context(|| format!("Failed to create snapshot {}", request.snapshot_id))
            },
            is_retryable_modify_error,
        )
        .await?;
        Ok(())
    }

    async fn restore_instance(&self, request: RestoreInstanceRequest) -> Result<()> {
        info!(
            instance = %request.instance_id,
            snapshot = %request.snapshot_id,
            "Restoring ephemeral DB instance"
        );
        let network = &request.network;
        let security_groups =
            (!network.security_group_ids.is_empty()).then(|| network.security_group_ids.clone());

        send_with_retry(
            "RestoreDBInstanceFromDBSnapshot",
            || async {
                self.client
                    .restore_db_instance_from_db_snapshot()
                    .db_instance_identifier(&request.instance_id)
                    .db_snapshot_identifier(&request.snapshot_id)
                    .set_db_subnet_group_name(network.db_subnet_group.clone())
                    .set_vpc_security_group_ids(security_groups.clone())
                    .set_db_instance_class(network.instance_class.clone())
                    .publicly_accessible(false)
                    .multi_az(false)
                    .auto_minor_version_upgrade(false)
                    .deletion_protection(false)
                    .copy_tags_to_snapshot(false)
                    .set_tags(Some(rds_tags(&request.tags)))
                    .send()
                    .await
                    .with_context(|| format!("Failed to restore instance {}", request.instance_id))
            },
            is_retryable,
        )
        .await?;
        Ok(())
    }

    async fn reset_credential(&self, instance_id: &str, credential: &Credential) -> Result<()> {
        info!(instance = %instance_id, "Resetting master credential");
        send_with_retry(
            "ModifyDBInstance",
            || async {
                self.client
                    .modify_db_instance()
                    .db_instance_identifier(instance_id)
                    .master_user_password(credential.expose())
                    .backup_retention_period(0)
                    .apply_immediately(true)
                    .send()
                    .await
                    .with_context(|| format!("Failed to modify DB instance {instance_id}"))
            },
            is_retryable_modify_error,
        )
        .await?;
        Ok(())
    }

    async fn share_snapshot(&self, snapshot_id: &str, account: &str) -> Result<()> {
        info!(snapshot = %snapshot_id, account = %account, "Sharing snapshot");
        send_with_retry(
            "ModifyDBSnapshotAttribute",
            || async {
                self.client
                    .modify_db_snapshot_attribute()
                    .db_snapshot_identifier(snapshot_id)
                    .attribute_name(RESTORE_ATTRIBUTE)
                    .values_to_add(account)
                    .send()
                    .await
                    .with_context(|| format!("Failed to share {snapshot_id} with {account}"))
            },
            is_retryable,
        )
        .await?;
        Ok(())
    }

    async fn delete_instance(&self, instance_id: &str) -> Result<()> {
        info!(instance = %instance_id, "Deleting DB instance");
        send_with_retry(
            "DeleteDBInstance",
            || async {
                self.client
                    .delete_db_instance()
                    .db_instance_identifier(instance_id)
                    .skip_final_snapshot(true)
                    .delete_automated_backups(true)
                    .send()
                    .await
                    .with_context(|| format!("Failed to delete DB instance {instance_id}"))
            },
            is_retryable,
        )
        .await?;
        Ok(())
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        info!(snapshot = %snapshot_id, "Deleting DB snapshot");
        send_with_retry(
            "DeleteDBSnapshot",
            || async {
                self.client
                    .delete_db_snapshot()
                    .db_snapshot_identifier(snapshot_id)
                    .send()
                    .await
                    .with_context(|| format!("Failed to delete snapshot {snapshot_id}"))
            },
            is_retryable,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_rds::types::{Endpoint as SdkEndpoint, PendingModifiedValues, Tag};

    #[test]
    fn test_instance_info_maps_pending_credential() {
        let instance = DbInstance::builder()
            .db_instance_identifier("prod-db-1a2b3c4d5e")
            .engine("postgres")
            .db_instance_status("modifying")
            .pending_modified_values(
                PendingModifiedValues::builder()
                    .master_user_password("****")
                    .build(),
            )
            .endpoint(
                SdkEndpoint::builder()
                    .address("prod-db-1a2b3c4d5e.abc.us-east-2.rds.amazonaws.com")
                    .port(5432)
                    .build(),
            )
            .master_username("admin")
            .storage_encrypted(true)
            .kms_key_id("arn:aws:kms:us-east-2:1:key/k")
            .tag_list(Tag::builder().key("rds-sanitizer:run-id").value("r").build())
            .build();

        let info = instance_info(&instance);
        assert!(info.pending_credential_change);
        assert_eq!(info.endpoint.unwrap().port, 5432);
        assert!(info.storage_encrypted);
        assert_eq!(info.tags.len(), 1);
        assert!(info.cluster_identifier.is_none());
    }

    #[test]
    fn test_instance_info_without_endpoint() {
        let instance = DbInstance::builder()
            .db_instance_identifier("creating-db")
            .db_instance_status("creating")
            .endpoint(SdkEndpoint::builder().address("x").build())
            .build();

        let info = instance_info(&instance);
        assert!(info.endpoint.is_none(), "no port means no endpoint");
        assert!(!info.pending_credential_change);
    }

    #[test]
    fn test_source_listing_includes_automated_snapshots() {
        let by_source = SnapshotFilter::Source("prod-db");
        assert_eq!(by_source.instance(), Some("prod-db"));
        assert_eq!(by_source.snapshot(), None);
        assert_eq!(by_source.snapshot_type(), None);

        let by_id = SnapshotFilter::Id("prod-db-1a2b3c4d5e");
        assert_eq!(by_id.instance(), None);
        assert_eq!(by_id.snapshot(), Some("prod-db-1a2b3c4d5e"));
        assert_eq!(by_id.snapshot_type(), Some("manual"));

        assert_eq!(SnapshotFilter::AllManual.snapshot_type(), Some("manual"));
    }

    #[test]
    fn test_snapshot_info_converts_time() {
        let snapshot = DbSnapshot::builder()
            .db_snapshot_identifier("prod-db-snap")
            .db_instance_identifier("prod-db")
            .status("available")
            .encrypted(true)
            .snapshot_create_time(aws_sdk_rds::primitives::DateTime::from_secs(1_700_000_000))
            .build();

        let info = snapshot_info(&snapshot);
        assert_eq!(info.source_db, "prod-db");
        assert_eq!(info.created_at.unwrap().timestamp(), 1_700_000_000);
        assert!(info.encrypted);
    }
}
