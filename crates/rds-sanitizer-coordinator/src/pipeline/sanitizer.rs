//! Sanitizer runner: executes the statements against the ephemeral instance

use anyhow::Result;
use rds_sanitizer_common::engine::STATEMENT_MARKER;
use rds_sanitizer_common::{ConnectionInfo, EngineKind, RunId};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::context::RunContext;
use super::error::PipelineError;
use super::{persist, transient_as_pending};
use crate::credential::Credential;
use crate::state::RunStore;
use crate::wait::{WaitConfig, WaitError, poll_until};

/// Maximum number of log lines carried into a failure diagnostic
const MAX_DIAGNOSTIC_LINES: usize = 20;

/// Everything the execution environment needs for one run
#[derive(Debug, Clone)]
pub struct SanitizationJob {
    pub run_id: RunId,
    pub engine: EngineKind,
    pub connection: ConnectionInfo,
    pub credential: Credential,
    /// Executed verbatim, in order
    pub statements: Vec<String>,
}

/// Reference to a launched sanitizer task, persisted so a resumed run can
/// re-attach instead of launching a second one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_arn: String,
    /// Where the task's output goes, when known
    pub log_stream: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Stopped {
        exit_code: Option<i32>,
        reason: Option<String>,
    },
}

/// Isolated, disposable execution environment for sanitization jobs
#[allow(async_fn_in_trait)] // Internal use only
#[cfg_attr(test, mockall::automock)]
pub trait Sanitizer {
    async fn launch(&self, job: SanitizationJob) -> Result<TaskHandle>;

    async fn status(&self, task: &TaskHandle) -> Result<TaskStatus>;

    /// Output lines of the task (stdout and stderr interleaved)
    async fn output(&self, task: &TaskHandle) -> Result<Vec<String>>;

    async fn stop(&self, task: &TaskHandle, reason: &str) -> Result<()>;
}

/// Run the sanitization statements and report the outcome
///
/// Re-attaches to `ctx.sanitizer_task` when one was already launched. A
/// failed task is never relaunched: partial execution leaves the instance
/// in an unknown state, and it is discarded anyway.
pub async fn run_sanitizer<S: Sanitizer>(
    sanitizer: &S,
    store: &RunStore,
    ctx: &mut RunContext,
    credential: Option<&Credential>,
    wait: &WaitConfig,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    let task = match &ctx.sanitizer_task {
        Some(task) => {
            info!(task = %task.task_arn, "Re-attaching to sanitizer task");
            task.clone()
        }
        None => {
            let job = build_job(ctx, credential)?;
            let statements = job.statements.len();
            let task = sanitizer.launch(job).await?;
            info!(task = %task.task_arn, statements, "Sanitizer task launched");
            ctx.sanitizer_task = Some(task.clone());
            persist(store, ctx).await?;
            task
        }
    };

    let resource = format!("sanitizer task {}", task.task_arn);
    let stopped = poll_until(
        wait,
        Some(cancel),
        || async {
            match transient_as_pending(sanitizer.status(&task).await, &resource)? {
                Some(TaskStatus::Stopped { exit_code, reason }) => Ok(Some((exit_code, reason))),
                _ => Ok(None),
            }
        },
        &resource,
    )
    .await;

    let (exit_code, reason) = match stopped {
        Ok(stopped) => stopped,
        Err(err) => {
            if !matches!(err, WaitError::Check(_)) {
                if let Err(e) = sanitizer.stop(&task, "rds-sanitizer run abandoned").await {
                    warn!(task = %task.task_arn, error = %e, "Failed to stop sanitizer task");
                }
            }
            return Err(err.into());
        }
    };

    let output = match sanitizer.output(&task).await {
        Ok(lines) => lines,
        Err(e) => {
            warn!(task = %task.task_arn, error = %e, "Failed to read sanitizer output");
            Vec::new()
        }
    };
    for line in &output {
        info!(target: "sanitizer", "{line}");
    }

    if exit_code == Some(0) {
        info!(task = %task.task_arn, "Sanitization succeeded");
        return Ok(());
    }

    let statement_index =
        rds_sanitizer_common::engine::failed_statement_index(output.iter().map(String::as_str));
    let detail = diagnostic(&output, exit_code, reason.as_deref());
    Err(PipelineError::SanitizationFailed {
        statement_index,
        detail,
    })
}

fn build_job(
    ctx: &RunContext,
    credential: Option<&Credential>,
) -> Result<SanitizationJob, PipelineError> {
    let source = ctx
        .source
        .as_ref()
        .ok_or_else(|| PipelineError::InvalidInput("source database not described".to_string()))?;
    let connection = ctx
        .connection
        .clone()
        .ok_or_else(|| PipelineError::InvalidInput("instance endpoint unknown".to_string()))?;
    let credential = credential
        .cloned()
        .ok_or_else(|| PipelineError::InvalidInput("no credential issued".to_string()))?;

    Ok(SanitizationJob {
        run_id: ctx.run_id.clone(),
        engine: source.engine,
        connection,
        credential,
        statements: ctx.inputs.statements.clone(),
    })
}

/// Engine error text: the output after the last progress marker, or the
/// task's stop reason when it printed nothing useful
fn diagnostic(output: &[String], exit_code: Option<i32>, reason: Option<&str>) -> String {
    let after_marker = output
        .iter()
        .rposition(|line| line.trim().starts_with(STATEMENT_MARKER))
        .map_or(0, |i| i + 1);
    let lines: Vec<&str> = output[after_marker..]
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .take(MAX_DIAGNOSTIC_LINES)
        .collect();

    if !lines.is_empty() {
        return lines.join("\n");
    }
    match (reason, exit_code) {
        (Some(reason), Some(code)) => format!("{reason} (exit code {code})"),
        (Some(reason), None) => reason.to_string(),
        (None, Some(code)) => format!("exit code {code}"),
        (None, None) => "task stopped without an exit code".to_string(),
    }
}
