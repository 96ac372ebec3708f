//! AWS resource scanner for finding rds-sanitizer resources by tags
//!
//! Discovers resources directly from AWS APIs, independent of the local
//! database. This finds ephemeral resources a crashed coordinator never
//! recorded, or whose state database was lost.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rds_sanitizer_common::ResourceKind;
use rds_sanitizer_common::tags::{
    TAG_CREATED_AT, TAG_RUN_ID, TAG_SOURCE, TAG_TOOL, TAG_TOOL_VALUE, parse_created_at,
};
use serde::Serialize;
use tracing::debug;

use super::context::{AwsContext, FromAwsContext};
use super::rds::RdsClient;
use super::tags::tag_map;
use crate::pipeline::{DbInstanceInfo, SnapshotInfo};

/// Discovered AWS resource from scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredResource {
    #[serde(serialize_with = "serialize_kind")]
    pub kind: ResourceKind,
    pub resource_id: String,
    pub run_id: String,
    pub source_db: Option<String>,
    /// Creation timestamp from tag, or the snapshot's creation time
    pub created_at: Option<DateTime<Utc>>,
    pub status: String,
}

fn serialize_kind<S: serde::Serializer>(kind: &ResourceKind, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(kind.as_str())
}

/// Scanner configuration
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Only find resources older than this duration
    pub min_age: Duration,
    /// Only find resources from specific run
    pub run_id: Option<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            min_age: Duration::minutes(10), // Grace period
            run_id: None,
        }
    }
}

/// Scanner for finding rds-sanitizer resources in AWS
pub struct ResourceScanner {
    rds: RdsClient,
}

impl FromAwsContext for ResourceScanner {
    fn from_context(ctx: &AwsContext) -> Self {
        Self {
            rds: RdsClient::from_context(ctx),
        }
    }
}

impl ResourceScanner {
    /// Scan instances and manual snapshots for ephemeral run resources
    pub async fn scan_all(&self, config: &ScanConfig) -> Result<Vec<DiscoveredResource>> {
        let (instances, snapshots) =
            tokio::join!(self.rds.list_instances(), self.rds.list_all_snapshots());
        let resources = select_ephemeral(&instances?, &snapshots?, config, Utc::now());
        debug!(count = resources.len(), "Found ephemeral resources");
        Ok(resources)
    }
}

/// Tagged ephemeral resources matching `config`
///
/// Only resources carrying both the tool tag and a run ID qualify; final
/// snapshots have no run ID and are never returned. Resources without any
/// creation time are treated as old enough.
pub fn select_ephemeral(
    instances: &[DbInstanceInfo],
    snapshots: &[SnapshotInfo],
    config: &ScanConfig,
    now: DateTime<Utc>,
) -> Vec<DiscoveredResource> {
    let instances = instances.iter().map(|i| {
        (
            ResourceKind::DbInstance,
            &i.identifier,
            tag_map(&i.tags),
            None,
            &i.status,
        )
    });
    let snapshots = snapshots.iter().map(|s| {
        (
            ResourceKind::DbSnapshot,
            &s.identifier,
            tag_map(&s.tags),
            s.created_at,
            &s.status,
        )
    });

    instances
        .chain(snapshots)
        .filter_map(|(kind, id, tags, fallback_created_at, status)| {
            build_discovered(kind, id, &tags, fallback_created_at, status, config, now)
        })
        .collect()
}

fn build_discovered(
    kind: ResourceKind,
    resource_id: &str,
    tags: &HashMap<String, String>,
    fallback_created_at: Option<DateTime<Utc>>,
    status: &str,
    config: &ScanConfig,
    now: DateTime<Utc>,
) -> Option<DiscoveredResource> {
    if tags.get(TAG_TOOL).map(String::as_str) != Some(TAG_TOOL_VALUE) {
        return None;
    }
    let run_id = tags.get(TAG_RUN_ID)?;
    if config.run_id.as_ref().is_some_and(|r| r != run_id) {
        return None;
    }

    let created_at = tags
        .get(TAG_CREATED_AT)
        .and_then(|s| parse_created_at(s))
        .or(fallback_created_at);
    if created_at.is_some_and(|at| now - at < config.min_age) {
        return None;
    }

    Some(DiscoveredResource {
        kind,
        resource_id: resource_id.to_string(),
        run_id: run_id.clone(),
        source_db: tags.get(TAG_SOURCE).cloned(),
        created_at,
        status: status.to_string(),
    })
}
