//! Control-plane facing types shared by the pipeline components

use chrono::{DateTime, Utc};
use rds_sanitizer_common::EngineKind;
use serde::{Deserialize, Serialize};

/// Resource tags as key/value pairs
pub type Tags = Vec<(String, String)>;

/// How the snapshot to restore from is obtained
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
    strum::EnumString,
    clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SnapshotMode {
    /// Reuse the most recent available snapshot of the source database
    ReuseLatest,
    /// Take a new snapshot of the source database
    CreateNew,
}

/// Coarse classification of a control-plane status string
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum StatusClass {
    Pending,
    Available,
    Failed,
}

/// Status fragments that mean a resource will never become available
const FAILED_STATUS_FRAGMENTS: &[&str] = &[
    "stop",
    "delet",
    "fail",
    "incompatible",
    "inaccessible",
    "error",
];

/// Classify an instance or snapshot status
///
/// Anything that is neither `available` nor a known dead end counts as
/// pending (creating, modifying, backing-up, resetting-master-credentials,
/// configuring-enhanced-monitoring, ...).
pub fn classify_status(status: &str) -> StatusClass {
    if status == "available" {
        StatusClass::Available
    } else if FAILED_STATUS_FRAGMENTS.iter().any(|f| status.contains(f)) {
        StatusClass::Failed
    } else {
        StatusClass::Pending
    }
}

/// Network placement of the ephemeral instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// DB subnet group (default VPC when unset)
    pub db_subnet_group: Option<String>,
    /// VPC security groups attached to the instance
    pub security_group_ids: Vec<String>,
    /// Instance class override (the snapshot's class when unset)
    pub instance_class: Option<String>,
}

/// The source database as described at run start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDatabase {
    pub identifier: String,
    pub engine: EngineKind,
    pub engine_version: Option<String>,
    pub storage_encrypted: bool,
    pub kms_key_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

/// A database instance as reported by the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbInstanceInfo {
    pub identifier: String,
    pub engine: String,
    pub engine_version: Option<String>,
    pub status: String,
    /// A master password or backup retention change is still pending
    pub pending_credential_change: bool,
    pub endpoint: Option<Endpoint>,
    pub master_username: Option<String>,
    pub db_name: Option<String>,
    pub storage_encrypted: bool,
    pub kms_key_id: Option<String>,
    /// Set when the instance is a member of a multi-node cluster
    pub cluster_identifier: Option<String>,
    pub tags: Tags,
}

/// A snapshot as reported by the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub identifier: String,
    /// Instance the snapshot was taken from
    pub source_db: String,
    pub status: String,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSnapshotRequest {
    pub snapshot_id: String,
    pub db_instance_id: String,
    pub tags: Tags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreInstanceRequest {
    pub instance_id: String,
    pub snapshot_id: String,
    pub network: NetworkConfig,
    pub tags: Tags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status("available"), StatusClass::Available);
        for pending in ["creating", "modifying", "backing-up", "resetting-master-credentials"] {
            assert_eq!(classify_status(pending), StatusClass::Pending, "{pending}");
        }
        for failed in [
            "failed",
            "deleting",
            "stopped",
            "incompatible-restore",
            "inaccessible-encryption-credentials",
            "storage-full-error",
        ] {
            assert_eq!(classify_status(failed), StatusClass::Failed, "{failed}");
        }
    }

    #[test]
    fn test_snapshot_mode_strings() {
        assert_eq!(SnapshotMode::ReuseLatest.to_string(), "reuse-latest");
        assert_eq!(
            "create-new".parse::<SnapshotMode>().ok(),
            Some(SnapshotMode::CreateNew)
        );
    }
}
