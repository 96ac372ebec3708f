//! Per-run context, persisted after every transition

use chrono::{DateTime, Utc};
use rds_sanitizer_common::tags::{
    TAG_CREATED_AT, TAG_RUN_ID, TAG_SOURCE, TAG_TOOL, TAG_TOOL_VALUE, format_created_at,
};
use rds_sanitizer_common::{
    ConnectionInfo, NameFormatError, ResourceKind, RunId, SnapshotNameFormat,
    defaults::IDENTIFIER_TOKEN_LEN, ephemeral_identifier, random_token,
};
use serde::{Deserialize, Serialize};

use super::error::Failure;
use super::sanitizer::TaskHandle;
use super::types::{NetworkConfig, SnapshotMode, SourceDatabase, Tags};

/// Inputs of one run, as supplied by the trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInputs {
    pub source_db: String,
    pub mode: SnapshotMode,
    /// Sanitization statements, already split, in execution order
    pub statements: Vec<String>,
    /// Accounts the final snapshot is shared with (may be empty)
    pub share_accounts: Vec<String>,
    pub name_format: String,
    /// Schedule this run was triggered by, recorded for reference
    pub schedule: Option<String>,
    pub network: NetworkConfig,
}

/// The snapshot the ephemeral instance is restored from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub identifier: String,
    /// True when this run created the snapshot (it is then deleted at cleanup)
    pub created_by_run: bool,
    pub kms_key_id: Option<String>,
}

/// The run's output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalSnapshot {
    pub identifier: String,
    pub kms_key_id: Option<String>,
    /// Accounts granted restore access so far
    pub shared_with: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: RunId,
    pub inputs: RunInputs,
    pub started_at: DateTime<Utc>,
    /// When the current state was entered; wait budgets count from here
    pub step_started_at: DateTime<Utc>,

    /// Run-unique identifier of the ephemeral instance
    pub instance_id: String,
    /// Run-unique identifier of the intermediate snapshot (create-new mode)
    pub intermediate_snapshot_id: String,
    /// Final snapshot name, resolved from the format when the run starts
    pub final_snapshot_id: String,

    pub source: Option<SourceDatabase>,
    pub snapshot: Option<SnapshotRef>,
    /// Set (and persisted) before the create request is issued
    pub intermediate_snapshot_requested: bool,
    /// Set (and persisted) before the restore request is issued
    pub instance_requested: bool,
    pub connection: Option<ConnectionInfo>,
    pub credential_issued_at: Option<DateTime<Utc>>,
    pub sanitizer_task: Option<TaskHandle>,
    pub final_snapshot_requested: bool,
    pub final_snapshot: Option<FinalSnapshot>,

    pub failure: Option<Failure>,
    pub cleanup_error: Option<String>,
}

impl RunContext {
    /// Create the context for a new run
    ///
    /// Derives the run-unique identifiers and resolves the final snapshot
    /// name, so a bad name format is rejected before anything is created.
    pub fn new(inputs: RunInputs, format: &SnapshotNameFormat) -> Result<Self, NameFormatError> {
        let run_id = RunId::generate();
        let now = Utc::now();
        let final_snapshot_id = format.render(&inputs.source_db, now, run_id.as_str())?;
        let instance_id =
            ephemeral_identifier(&inputs.source_db, &random_token(IDENTIFIER_TOKEN_LEN));
        let intermediate_snapshot_id =
            ephemeral_identifier(&inputs.source_db, &random_token(IDENTIFIER_TOKEN_LEN));

        Ok(Self {
            run_id,
            inputs,
            started_at: now,
            step_started_at: now,
            instance_id,
            intermediate_snapshot_id,
            final_snapshot_id,
            source: None,
            snapshot: None,
            intermediate_snapshot_requested: false,
            instance_requested: false,
            connection: None,
            credential_issued_at: None,
            sanitizer_task: None,
            final_snapshot_requested: false,
            final_snapshot: None,
            failure: None,
            cleanup_error: None,
        })
    }

    /// Ephemeral resources this run may have created, in cleanup order
    pub fn ephemeral_resources(&self) -> Vec<(ResourceKind, String)> {
        let mut resources = Vec::new();
        if self.instance_requested {
            resources.push((ResourceKind::DbInstance, self.instance_id.clone()));
        }
        if self.intermediate_snapshot_requested {
            resources.push((ResourceKind::DbSnapshot, self.intermediate_snapshot_id.clone()));
        }
        resources.sort_by_key(|(kind, _)| kind.cleanup_priority());
        resources
    }

    pub fn has_ephemeral_resources(&self) -> bool {
        self.instance_requested || self.intermediate_snapshot_requested
    }

    /// Tags for the instance and intermediate snapshot
    pub fn ephemeral_tags(&self) -> Tags {
        vec![
            (TAG_TOOL.to_string(), TAG_TOOL_VALUE.to_string()),
            (TAG_RUN_ID.to_string(), self.run_id.to_string()),
            (TAG_CREATED_AT.to_string(), format_created_at(self.started_at)),
            (TAG_SOURCE.to_string(), self.inputs.source_db.clone()),
        ]
    }

    /// Tags for the final snapshot; no run ID, so run cleanup never selects it
    pub fn final_snapshot_tags(&self) -> Tags {
        vec![
            (TAG_TOOL.to_string(), TAG_TOOL_VALUE.to_string()),
            (TAG_CREATED_AT.to_string(), format_created_at(self.started_at)),
            (TAG_SOURCE.to_string(), self.inputs.source_db.clone()),
        ]
    }
}

#[cfg(test)]
pub(crate) fn test_inputs(source_db: &str, mode: SnapshotMode) -> RunInputs {
    RunInputs {
        source_db: source_db.to_string(),
        mode,
        statements: vec![
            "UPDATE users SET ssn=NULL".to_string(),
            "DELETE FROM payments".to_string(),
        ],
        share_accounts: vec!["111111111111".to_string()],
        name_format: "sanitized-{date}".to_string(),
        schedule: None,
        network: NetworkConfig::default(),
    }
}
