//! State types

use chrono::{DateTime, Utc};
use rds_sanitizer_common::ResourceKind;
use serde::Serialize;

use crate::pipeline::{RunContext, RunState};

/// One row of the `runs` table, without the serialized context
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub source_db: String,
    pub mode: String,
    pub region: String,
    pub state: RunState,
    pub failure_step: Option<String>,
    pub failure_kind: Option<String>,
    pub failure_detail: Option<String>,
    pub final_snapshot_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A run as needed to resume it
#[derive(Debug, Clone)]
pub struct StoredRun {
    pub record: RunRecord,
    pub context: RunContext,
}

/// An ephemeral resource recorded for a run
#[derive(Debug, Clone, Serialize)]
pub struct TrackedResource {
    pub run_id: String,
    #[serde(serialize_with = "serialize_kind")]
    pub kind: ResourceKind,
    pub resource_id: String,
    pub region: String,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

fn serialize_kind<S: serde::Serializer>(kind: &ResourceKind, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(kind.as_str())
}

/// One entry of a run's transition history
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub at: DateTime<Utc>,
    pub from_state: Option<String>,
    pub to_state: String,
    pub message: String,
}

pub(crate) fn parse_timestamp(s: &str) -> anyhow::Result<DateTime<Utc>> {
    use anyhow::Context;
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp '{s}'"))?
        .with_timezone(&Utc))
}
