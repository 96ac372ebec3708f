//! Configuration types for the coordinator

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rds_sanitizer_common::defaults::{
    DEFAULT_CLEANUP_TIMEOUT_SECS, DEFAULT_INSTANCE_TIMEOUT_SECS, DEFAULT_MAX_POLL_INTERVAL_SECS,
    DEFAULT_POLL_INTERVAL_SECS, DEFAULT_SANITIZE_TIMEOUT_SECS, DEFAULT_SNAPSHOT_TIMEOUT_SECS,
};
use rds_sanitizer_common::{
    EngineKind, NameFormatError, ScheduleError, ScheduleExpression, SnapshotNameFormat,
    validate_identifier,
};
use thiserror::Error;
use tracing::warn;

use crate::aws::AccountId;
use crate::pipeline::{NetworkConfig, RunInputs, RunState, SnapshotMode};
use crate::wait::WaitConfig;

/// Default time an instance must look settled after a credential reset
/// when the pending phase was never observed
pub const DEFAULT_CREDENTIAL_SETTLE_SECS: u64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid source database identifier: {0}")]
    SourceDb(NameFormatError),

    #[error("invalid snapshot name format: {0}")]
    NameFormat(NameFormatError),

    #[error("invalid schedule expression: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("no sanitization statements given")]
    NoStatements,

    #[error("no sanitizer task definition configured for any engine")]
    NoTaskDefinition,

    #[error("no subnets configured for the sanitizer task")]
    NoTaskSubnets,

    #[error("invalid wait settings: {0}")]
    WaitSettings(String),
}

/// What a run works on
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source_db: String,
    pub mode: SnapshotMode,
    /// Already split on the delimiter
    pub statements: Vec<String>,
    pub share_accounts: Vec<String>,
    pub name_format: SnapshotNameFormat,
    /// Recorded with the run; triggering is external
    pub schedule: Option<ScheduleExpression>,
}

/// Sanitizer task definitions, one per engine family
#[derive(Debug, Clone, Default)]
pub struct TaskDefinitions {
    pub postgres: Option<String>,
    pub mysql: Option<String>,
    /// Falls back to the MySQL definition
    pub mariadb: Option<String>,
}

impl TaskDefinitions {
    pub fn for_engine(&self, engine: EngineKind) -> Option<&str> {
        match engine {
            EngineKind::Postgres => self.postgres.as_deref(),
            EngineKind::MySql => self.mysql.as_deref(),
            EngineKind::MariaDb => self.mariadb.as_deref().or(self.mysql.as_deref()),
        }
    }

    fn is_empty(&self) -> bool {
        self.postgres.is_none() && self.mysql.is_none() && self.mariadb.is_none()
    }
}

/// Where and how the sanitizer task runs
#[derive(Debug, Clone)]
pub struct SanitizerConfig {
    pub cluster: String,
    pub task_definitions: TaskDefinitions,
    pub container_name: String,
    pub log_group: Option<String>,
    pub log_stream_prefix: String,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    /// Needed in public subnets without NAT to pull the client image
    pub assign_public_ip: bool,
}

/// Poll intervals and per-state wait budgets
#[derive(Debug, Clone)]
pub struct WaitSettings {
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    /// Snapshot creation (intermediate and final)
    pub snapshot_timeout: Duration,
    /// Instance restore and credential propagation
    pub instance_timeout: Duration,
    pub sanitize_timeout: Duration,
    pub cleanup_timeout: Duration,
    pub credential_settle: Duration,
    pub jitter: bool,
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_poll_interval: Duration::from_secs(DEFAULT_MAX_POLL_INTERVAL_SECS),
            snapshot_timeout: Duration::from_secs(DEFAULT_SNAPSHOT_TIMEOUT_SECS),
            instance_timeout: Duration::from_secs(DEFAULT_INSTANCE_TIMEOUT_SECS),
            sanitize_timeout: Duration::from_secs(DEFAULT_SANITIZE_TIMEOUT_SECS),
            cleanup_timeout: Duration::from_secs(DEFAULT_CLEANUP_TIMEOUT_SECS),
            credential_settle: Duration::from_secs(DEFAULT_CREDENTIAL_SETTLE_SECS),
            jitter: true,
        }
    }
}

impl WaitSettings {
    /// Total wait budget of a state
    pub fn budget(&self, state: RunState) -> Duration {
        match state {
            RunState::LocatingSnapshot
            | RunState::FinalizingSnapshot
            | RunState::AwaitingFinalSnapshot => self.snapshot_timeout,
            RunState::ProvisioningInstance
            | RunState::AwaitingInstanceReady
            | RunState::ResettingCredential
            | RunState::AwaitingCredentialApplied
            | RunState::Sharing => self.instance_timeout,
            RunState::Sanitizing => self.sanitize_timeout,
            RunState::CleaningUp => self.cleanup_timeout,
            RunState::Succeeded | RunState::Failed | RunState::CleanupFailed => Duration::ZERO,
        }
    }

    /// Wait configuration for `state`, entered at `step_started_at`
    ///
    /// The budget is what is left of the state's total, so restarts do not
    /// extend it. At least one poll interval is always granted, so a resumed
    /// run checks the resource once before timing out. Cleanup is the
    /// exception: every attempt gets the full [`cleanup`](Self::cleanup)
    /// budget, however long ago the run entered it.
    pub fn for_state(&self, state: RunState, step_started_at: DateTime<Utc>) -> WaitConfig {
        if state == RunState::CleaningUp {
            return self.cleanup();
        }

        let spent = (Utc::now() - step_started_at).to_std().unwrap_or_default();
        let remaining = self
            .budget(state)
            .saturating_sub(spent)
            .max(self.poll_interval);

        WaitConfig {
            initial_delay: self.poll_interval,
            max_delay: self.max_poll_interval,
            timeout: remaining,
            jitter: self.jitter,
        }
    }

    /// Wait configuration for a cleanup pass, in a run or standalone
    pub fn cleanup(&self) -> WaitConfig {
        WaitConfig {
            initial_delay: self.poll_interval,
            max_delay: self.max_poll_interval,
            timeout: self.cleanup_timeout,
            jitter: self.jitter,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::WaitSettings(
                "poll interval must be positive".to_string(),
            ));
        }
        if self.max_poll_interval < self.poll_interval {
            return Err(ConfigError::WaitSettings(format!(
                "max poll interval {:?} is shorter than poll interval {:?}",
                self.max_poll_interval, self.poll_interval
            )));
        }
        Ok(())
    }
}

/// AWS infrastructure configuration
#[derive(Debug, Clone)]
pub struct AwsConfig {
    pub region: String,
    /// AWS profile name (overrides default credential resolution)
    pub aws_profile: Option<String>,
}

/// Runtime behavior flags
#[derive(Debug, Clone, Default)]
pub struct RuntimeFlags {
    /// Validate and print the plan without touching AWS
    pub dry_run: bool,
    /// State database location (per-user data directory when unset)
    pub state_db: Option<PathBuf>,
}

/// Configuration for a pipeline run
///
/// Composed of focused sub-configs; validated as a whole before any AWS
/// call is made.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub pipeline: PipelineConfig,
    pub network: NetworkConfig,
    pub sanitizer: SanitizerConfig,
    pub waits: WaitSettings,
    pub aws: AwsConfig,
    pub flags: RuntimeFlags,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier(&self.pipeline.source_db).map_err(ConfigError::SourceDb)?;
        if self.pipeline.statements.is_empty() {
            return Err(ConfigError::NoStatements);
        }
        if self.sanitizer.task_definitions.is_empty() {
            return Err(ConfigError::NoTaskDefinition);
        }
        if self.sanitizer.subnets.is_empty() {
            return Err(ConfigError::NoTaskSubnets);
        }
        self.waits.validate()?;

        // Rejected accounts surface as a sharing failure of the run
        for account in &self.pipeline.share_accounts {
            if let Err(e) = AccountId::parse(account) {
                warn!(error = %e, "Share account will likely be rejected");
            }
        }

        Ok(())
    }

    /// Trigger inputs of a new run
    pub fn run_inputs(&self) -> RunInputs {
        RunInputs {
            source_db: self.pipeline.source_db.clone(),
            mode: self.pipeline.mode,
            statements: self.pipeline.statements.clone(),
            share_accounts: self.pipeline.share_accounts.clone(),
            name_format: self.pipeline.name_format.to_string(),
            schedule: self.pipeline.schedule.as_ref().map(ToString::to_string),
            network: self.network.clone(),
        }
    }

    pub fn source_db(&self) -> &str {
        &self.pipeline.source_db
    }
    pub fn name_format(&self) -> &SnapshotNameFormat {
        &self.pipeline.name_format
    }
    pub fn region(&self) -> &str {
        &self.aws.region
    }
    pub fn aws_profile(&self) -> Option<&str> {
        self.aws.aws_profile.as_deref()
    }
    pub fn dry_run(&self) -> bool {
        self.flags.dry_run
    }
    pub fn state_db(&self) -> Option<&std::path::Path> {
        self.flags.state_db.as_deref()
    }
}

/// Parse a name format, mapping the error for CLI use
pub fn parse_name_format(s: &str) -> Result<SnapshotNameFormat, ConfigError> {
    s.parse().map_err(ConfigError::NameFormat)
}

#[cfg(test)]
pub(crate) fn test_config() -> RunConfig {
    RunConfig {
        pipeline: PipelineConfig {
            source_db: "prod-db".to_string(),
            mode: SnapshotMode::CreateNew,
            statements: vec!["UPDATE users SET ssn=NULL".to_string()],
            share_accounts: vec!["111111111111".to_string()],
            name_format: "sanitized-{date}".parse().unwrap(),
            schedule: Some("rate(7 days)".parse().unwrap()),
        },
        network: NetworkConfig::default(),
        sanitizer: SanitizerConfig {
            cluster: "sanitizer".to_string(),
            task_definitions: TaskDefinitions {
                postgres: Some("psql:3".to_string()),
                mysql: Some("mysql:1".to_string()),
                mariadb: None,
            },
            container_name: "sql".to_string(),
            log_group: Some("/rds-sanitizer".to_string()),
            log_stream_prefix: "sql".to_string(),
            subnets: vec!["subnet-1".to_string()],
            security_groups: vec![],
            assign_public_ip: false,
        },
        waits: WaitSettings::default(),
        aws: AwsConfig {
            region: "us-east-2".to_string(),
            aws_profile: None,
        },
        flags: RuntimeFlags::default(),
    }
}
