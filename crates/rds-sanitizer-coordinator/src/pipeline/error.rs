//! Pipeline failure taxonomy

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::run_state::RunState;
use crate::wait::WaitError;

/// An account grant the control plane rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareFailure {
    pub account: String,
    pub reason: String,
}

/// Why a pipeline step failed
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Nothing to work from (no source database, no snapshot to reuse)
    #[error("{0} not found")]
    NotFound(String),

    #[error("timed out after {elapsed:?} waiting for {resource}")]
    Timeout { resource: String, elapsed: Duration },

    /// A resource reached a state it will not recover from
    #[error("{resource} failed: {detail}")]
    ProvisioningFailed { resource: String, detail: String },

    #[error("sanitization failed{}: {detail}", statement_suffix(.statement_index))]
    SanitizationFailed {
        statement_index: Option<usize>,
        detail: String,
    },

    #[error("sharing failed for account(s) {}", join_accounts(.failed_accounts))]
    SharingFailed { failed_accounts: Vec<ShareFailure> },

    #[error("cleanup failed, still present: {}", .remaining.join(", "))]
    CleanupFailed { remaining: Vec<String>, detail: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A control-plane request was rejected (after transient retries)
    #[error("control plane request failed: {0:#}")]
    ControlPlane(#[from] anyhow::Error),

    #[error("state database error: {0:#}")]
    Persistence(anyhow::Error),
}

fn statement_suffix(index: &Option<usize>) -> String {
    index
        .map(|i| format!(" at statement {i}"))
        .unwrap_or_default()
}

fn join_accounts(failures: &[ShareFailure]) -> String {
    failures
        .iter()
        .map(|f| f.account.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PipelineError::NotFound(_) => FailureKind::NotFound,
            PipelineError::Timeout { .. } => FailureKind::Timeout,
            PipelineError::ProvisioningFailed { .. } => FailureKind::ProvisioningFailed,
            PipelineError::SanitizationFailed { .. } => FailureKind::SanitizationFailed,
            PipelineError::SharingFailed { .. } => FailureKind::SharingFailed,
            PipelineError::CleanupFailed { .. } => FailureKind::CleanupFailed,
            PipelineError::Cancelled => FailureKind::Cancelled,
            PipelineError::InvalidInput(_) => FailureKind::InvalidInput,
            PipelineError::ControlPlane(_) => FailureKind::ControlPlane,
            PipelineError::Persistence(_) => FailureKind::Persistence,
        }
    }
}

impl From<WaitError<PipelineError>> for PipelineError {
    fn from(err: WaitError<PipelineError>) -> Self {
        match err {
            WaitError::Timeout {
                resource, elapsed, ..
            } => PipelineError::Timeout { resource, elapsed },
            WaitError::Cancelled(_) => PipelineError::Cancelled,
            WaitError::Check(e) => e,
        }
    }
}

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
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FailureKind {
    NotFound,
    Timeout,
    ProvisioningFailed,
    SanitizationFailed,
    SharingFailed,
    CleanupFailed,
    Cancelled,
    InvalidInput,
    ControlPlane,
    Persistence,
}

/// Persisted record of the failure that ended a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// State the run was in when the failure happened
    pub step: RunState,
    pub kind: FailureKind,
    pub message: String,
    #[serde(default)]
    pub statement_index: Option<usize>,
    #[serde(default)]
    pub failed_accounts: Vec<ShareFailure>,
}

impl Failure {
    pub fn new(step: RunState, err: &PipelineError) -> Self {
        let (statement_index, failed_accounts) = match err {
            PipelineError::SanitizationFailed {
                statement_index, ..
            } => (*statement_index, Vec::new()),
            PipelineError::SharingFailed { failed_accounts } => (None, failed_accounts.clone()),
            _ => (None, Vec::new()),
        };
        Self {
            step,
            kind: err.kind(),
            message: err.to_string(),
            statement_index,
            failed_accounts,
        }
    }
}
