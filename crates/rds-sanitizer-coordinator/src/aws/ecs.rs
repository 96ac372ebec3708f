//! Sanitizer tasks on ECS Fargate
//!
//! Each job runs the engine's SQL client in a fresh task: nothing persists
//! between runs. The command and credentials are passed as container
//! overrides; output goes to the task definition's awslogs stream.

use anyhow::{Context, Result, bail};
use aws_sdk_ecs::types::{
    AssignPublicIp, AwsVpcConfiguration, ContainerOverride, KeyValuePair, LaunchType,
    NetworkConfiguration, Task, TaskOverride,
};
use tracing::{debug, info, warn};

use super::context::AwsContext;
use super::error::is_retryable;
use super::logs::LogReader;
use super::retry::send_with_retry;
use super::tags::ecs_tags;
use crate::aws::FromAwsContext;
use crate::config::SanitizerConfig;
use crate::pipeline::{SanitizationJob, Sanitizer, TaskHandle, TaskStatus};

/// `startedBy` is limited to 36 characters
const STARTED_BY: &str = "rds-sanitizer";

/// ECS limits stop reasons to 255 characters
const MAX_STOP_REASON: usize = 255;

pub struct EcsSanitizer {
    client: aws_sdk_ecs::Client,
    logs: LogReader,
    config: SanitizerConfig,
}

/// Last path segment of a task ARN
fn task_id(task_arn: &str) -> &str {
    task_arn.rsplit('/').next().unwrap_or(task_arn)
}

/// Stream name the awslogs driver uses: `<prefix>/<container>/<task id>`
fn log_stream_name(prefix: &str, container: &str, task_arn: &str) -> String {
    format!("{prefix}/{container}/{}", task_id(task_arn))
}

fn task_status(task: &Task, container: &str) -> TaskStatus {
    match task.last_status().unwrap_or_default() {
        "STOPPED" => {
            let container = task
                .containers()
                .iter()
                .find(|c| c.name() == Some(container));
            let reason = container
                .and_then(|c| c.reason())
                .or(task.stopped_reason())
                .map(str::to_string);
            TaskStatus::Stopped {
                exit_code: container.and_then(|c| c.exit_code()),
                reason,
            }
        }
        "PROVISIONING" | "PENDING" | "ACTIVATING" => TaskStatus::Pending,
        _ => TaskStatus::Running,
    }
}

impl EcsSanitizer {
    pub fn new(aws: &AwsContext, config: SanitizerConfig) -> Self {
        Self {
            client: aws.ecs_client(),
            logs: LogReader::from_context(aws),
            config,
        }
    }

    fn network_configuration(&self) -> Result<NetworkConfiguration> {
        let assign_public_ip = if self.config.assign_public_ip {
            AssignPublicIp::Enabled
        } else {
            AssignPublicIp::Disabled
        };
        let vpc = AwsVpcConfiguration::builder()
            .set_subnets(Some(self.config.subnets.clone()))
            .set_security_groups(
                (!self.config.security_groups.is_empty())
                    .then(|| self.config.security_groups.clone()),
            )
            .assign_public_ip(assign_public_ip)
            .build()
            .context("Invalid sanitizer network configuration")?;
        Ok(NetworkConfiguration::builder()
            .awsvpc_configuration(vpc)
            .build())
    }
}

impl Sanitizer for EcsSanitizer {
    async fn launch(&self, job: SanitizationJob) -> Result<TaskHandle> {
        let task_definition = self
            .config
            .task_definitions
            .for_engine(job.engine)
            .with_context(|| format!("No sanitizer task definition for {}", job.engine))?;
        let container = &self.config.container_name;

        let command = job
            .engine
            .sanitizer_command(&job.connection, &job.statements);
        let environment: Vec<KeyValuePair> = job
            .engine
            .connection_env(&job.connection, job.credential.expose())
            .into_iter()
            .map(|(name, value)| KeyValuePair::builder().name(name).value(value).build())
            .collect();
        let overrides = TaskOverride::builder()
            .container_overrides(
                ContainerOverride::builder()
                    .name(container)
                    .set_command(Some(command))
                    .set_environment(Some(environment))
                    .build(),
            )
            .build();
        let network = self.network_configuration()?;

        info!(
            run_id = %job.run_id,
            cluster = %self.config.cluster,
            task_definition,
            engine = %job.engine,
            "Launching sanitizer task"
        );

        let output = send_with_retry(
            "RunTask",
            || async {
                self.client
                    .run_task()
                    .cluster(&self.config.cluster)
                    .task_definition(task_definition)
                    .launch_type(LaunchType::Fargate)
                    .count(1)
                    .network_configuration(network.clone())
                    .overrides(overrides.clone())
                    .started_by(STARTED_BY)
                    .set_tags(Some(ecs_tags(job.run_id.as_str())))
                    .send()
                    .await
                    .context("Failed to run sanitizer task")
            },
            is_retryable,
        )
        .await?;

        if let Some(failure) = output.failures().first() {
            bail!(
                "Sanitizer task not started: {} ({})",
                failure.reason().unwrap_or("unknown reason"),
                failure.detail().unwrap_or("no detail")
            );
        }
        let task_arn = output
            .tasks()
            .first()
            .and_then(|t| t.task_arn())
            .context("RunTask returned no task")?
            .to_string();

        let log_stream = self
            .config
            .log_group
            .as_ref()
            .map(|_| log_stream_name(&self.config.log_stream_prefix, container, &task_arn));

        Ok(TaskHandle {
            task_arn,
            log_stream,
        })
    }

    async fn status(&self, task: &TaskHandle) -> Result<TaskStatus> {
        let output = send_with_retry(
            "DescribeTasks",
            || async {
                self.client
                    .describe_tasks()
                    .cluster(&self.config.cluster)
                    .tasks(&task.task_arn)
                    .send()
                    .await
                    .with_context(|| format!("Failed to describe task {}", task.task_arn))
            },
            is_retryable,
        )
        .await?;

        match output.tasks().first() {
            Some(t) => {
                let status = task_status(t, &self.config.container_name);
                debug!(task = %task.task_arn, status = ?status, "Sanitizer task status");
                Ok(status)
            }
            // Stopped tasks are only described for about an hour
            None => Ok(TaskStatus::Stopped {
                exit_code: None,
                reason: Some("task no longer known to ECS".to_string()),
            }),
        }
    }

    async fn output(&self, task: &TaskHandle) -> Result<Vec<String>> {
        match (&self.config.log_group, &task.log_stream) {
            (Some(group), Some(stream)) => self.logs.read_stream(group, stream).await,
            _ => {
                warn!(task = %task.task_arn, "No log group configured, task output unavailable");
                Ok(Vec::new())
            }
        }
    }

    async fn stop(&self, task: &TaskHandle, reason: &str) -> Result<()> {
        let reason: String = reason.chars().take(MAX_STOP_REASON).collect();
        info!(task = %task.task_arn, reason = %reason, "Stopping sanitizer task");
        send_with_retry(
            "StopTask",
            || async {
                self.client
                    .stop_task()
                    .cluster(&self.config.cluster)
                    .task(&task.task_arn)
                    .reason(&reason)
                    .send()
                    .await
                    .with_context(|| format!("Failed to stop task {}", task.task_arn))
            },
            is_retryable,
        )
        .await?;
        Ok(())
    }
}
