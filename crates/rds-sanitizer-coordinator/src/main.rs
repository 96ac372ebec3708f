//! rds-sanitizer: sanitized RDS snapshots through an ephemeral restore
//!
//! Restores a snapshot of a production database into a throwaway instance,
//! runs sanitization SQL against it, snapshots the result and shares it with
//! other accounts. Runs are recorded in a local state database so they can
//! be inspected, resumed and cleaned up after a crash.

#![recursion_limit = "256"]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{Table, presets::UTF8_FULL_CONDENSED};
use rds_sanitizer::aws::{
    AwsContext, CleanupConfig, EcsSanitizer, FromAwsContext, RdsClient, ResourceScanner,
    ScanConfig, cleanup_orphans, collect_candidates,
};
use rds_sanitizer::config::{self, ConfigError, RunConfig};
use rds_sanitizer::pipeline::{NetworkConfig, RunContext, RunEngine, RunOutcome, RunState};
use rds_sanitizer::shutdown::cancel_on_shutdown;
use rds_sanitizer::state::{self, RunStore, open_db};
use rds_sanitizer_common::defaults::{
    DEFAULT_CLEANUP_TIMEOUT_SECS, DEFAULT_CONTAINER_NAME, DEFAULT_INSTANCE_TIMEOUT_SECS,
    DEFAULT_LOG_STREAM_PREFIX, DEFAULT_MAX_POLL_INTERVAL_SECS, DEFAULT_POLL_INTERVAL_SECS,
    DEFAULT_REGION, DEFAULT_SANITIZE_TIMEOUT_SECS, DEFAULT_SNAPSHOT_NAME_FORMAT,
    DEFAULT_SNAPSHOT_TIMEOUT_SECS, DEFAULT_SQL_DELIMITER,
};
use rds_sanitizer_common::{ScheduleExpression, SnapshotNameFormat, split_list, split_statements};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Exit code of a run that failed but cleaned up
const EXIT_FAILED: i32 = 1;
/// Exit code of a run that left ephemeral resources behind
const EXIT_CLEANUP_FAILED: i32 = 2;

#[derive(Parser, Debug)]
#[command(name = "rds-sanitizer")]
#[command(about = "Sanitized, shareable RDS snapshots")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct AwsArgs {
    /// AWS region
    #[arg(long, env = "AWS_REGION", default_value = DEFAULT_REGION)]
    region: String,

    /// AWS profile to use (overrides AWS_PROFILE env var)
    #[arg(long)]
    aws_profile: Option<String>,
}

#[derive(clap::Args, Debug)]
struct StateArgs {
    /// State database path (default: per-user data directory)
    #[arg(long, env = "RDS_SANITIZER_STATE_DB")]
    state_db: Option<PathBuf>,
}

/// Where the sanitizer task runs
#[derive(clap::Args, Debug)]
struct SanitizerArgs {
    /// ECS cluster the sanitizer task runs in
    #[arg(long, env = "RDS_SANITIZER_CLUSTER")]
    cluster: String,

    /// Task definition for PostgreSQL sources
    #[arg(long, env = "RDS_SANITIZER_POSTGRES_TASK")]
    postgres_task: Option<String>,

    /// Task definition for MySQL sources
    #[arg(long, env = "RDS_SANITIZER_MYSQL_TASK")]
    mysql_task: Option<String>,

    /// Task definition for MariaDB sources (defaults to the MySQL one)
    #[arg(long, env = "RDS_SANITIZER_MARIADB_TASK")]
    mariadb_task: Option<String>,

    /// Container running the SQL client
    #[arg(long, env = "RDS_SANITIZER_CONTAINER", default_value = DEFAULT_CONTAINER_NAME)]
    container_name: String,

    /// CloudWatch log group of the sanitizer container
    #[arg(long, env = "RDS_SANITIZER_LOG_GROUP")]
    log_group: Option<String>,

    /// awslogs stream prefix of the sanitizer container
    #[arg(long, env = "RDS_SANITIZER_LOG_STREAM_PREFIX", default_value = DEFAULT_LOG_STREAM_PREFIX)]
    log_stream_prefix: String,

    /// Comma-separated subnets for the sanitizer task
    #[arg(long, env = "RDS_SANITIZER_TASK_SUBNETS")]
    task_subnets: String,

    /// Comma-separated security groups for the sanitizer task
    #[arg(long, env = "RDS_SANITIZER_TASK_SECURITY_GROUPS", default_value = "")]
    task_security_groups: String,

    /// Assign a public IP to the sanitizer task
    #[arg(long, env = "RDS_SANITIZER_ASSIGN_PUBLIC_IP")]
    assign_public_ip: bool,
}

impl From<SanitizerArgs> for config::SanitizerConfig {
    fn from(args: SanitizerArgs) -> Self {
        Self {
            cluster: args.cluster,
            task_definitions: config::TaskDefinitions {
                postgres: args.postgres_task,
                mysql: args.mysql_task,
                mariadb: args.mariadb_task,
            },
            container_name: args.container_name,
            log_group: args.log_group,
            log_stream_prefix: args.log_stream_prefix,
            subnets: split_list(&args.task_subnets),
            security_groups: split_list(&args.task_security_groups),
            assign_public_ip: args.assign_public_ip,
        }
    }
}

/// Poll intervals and wait bounds, in seconds
#[derive(clap::Args, Debug)]
struct WaitArgs {
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
    poll_interval: u64,

    #[arg(long, default_value_t = DEFAULT_MAX_POLL_INTERVAL_SECS)]
    max_poll_interval: u64,

    /// Bound on snapshot creation
    #[arg(long, default_value_t = DEFAULT_SNAPSHOT_TIMEOUT_SECS)]
    snapshot_timeout: u64,

    /// Bound on instance restore and credential propagation
    #[arg(long, default_value_t = DEFAULT_INSTANCE_TIMEOUT_SECS)]
    instance_timeout: u64,

    /// Bound on the sanitizer task
    #[arg(long, default_value_t = DEFAULT_SANITIZE_TIMEOUT_SECS)]
    sanitize_timeout: u64,

    /// Bound on deletion of ephemeral resources
    #[arg(long, default_value_t = DEFAULT_CLEANUP_TIMEOUT_SECS)]
    cleanup_timeout: u64,
}

impl From<WaitArgs> for config::WaitSettings {
    fn from(args: WaitArgs) -> Self {
        Self {
            poll_interval: Duration::from_secs(args.poll_interval),
            max_poll_interval: Duration::from_secs(args.max_poll_interval),
            snapshot_timeout: Duration::from_secs(args.snapshot_timeout),
            instance_timeout: Duration::from_secs(args.instance_timeout),
            sanitize_timeout: Duration::from_secs(args.sanitize_timeout),
            cleanup_timeout: Duration::from_secs(args.cleanup_timeout),
            ..Default::default()
        }
    }
}

/// Arguments for the run command (extracted to reduce enum size)
#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Identifier of the source database instance
    #[arg(long, env = "RDS_SANITIZER_SOURCE_DB")]
    source_db: String,

    /// How the snapshot to restore from is obtained
    #[arg(long, env = "RDS_SANITIZER_SNAPSHOT_MODE", value_enum, default_value = "create-new")]
    mode: rds_sanitizer::pipeline::SnapshotMode,

    /// Sanitization SQL, split on --sql-delimiter
    #[arg(long, env = "RDS_SANITIZER_SQL")]
    sql: String,

    #[arg(long, env = "RDS_SANITIZER_SQL_DELIMITER", default_value = DEFAULT_SQL_DELIMITER)]
    sql_delimiter: String,

    /// Comma-separated accounts to share the final snapshot with
    #[arg(long, env = "RDS_SANITIZER_SHARE_ACCOUNTS", default_value = "")]
    share_accounts: String,

    /// Final snapshot name format
    #[arg(
        long,
        env = "RDS_SANITIZER_NAME_FORMAT",
        default_value = DEFAULT_SNAPSHOT_NAME_FORMAT,
        value_parser = config::parse_name_format
    )]
    name_format: SnapshotNameFormat,

    /// Schedule this run belongs to (recorded only)
    #[arg(long, env = "RDS_SANITIZER_SCHEDULE")]
    schedule: Option<ScheduleExpression>,

    /// DB subnet group for the ephemeral instance
    #[arg(long, env = "RDS_SANITIZER_DB_SUBNET_GROUP")]
    db_subnet_group: Option<String>,

    /// Comma-separated VPC security groups for the ephemeral instance
    #[arg(long, env = "RDS_SANITIZER_DB_SECURITY_GROUPS", default_value = "")]
    db_security_groups: String,

    /// Instance class of the ephemeral instance (default: the snapshot's)
    #[arg(long, env = "RDS_SANITIZER_INSTANCE_CLASS")]
    instance_class: Option<String>,

    #[command(flatten)]
    sanitizer: SanitizerArgs,

    #[command(flatten)]
    waits: WaitArgs,

    #[command(flatten)]
    aws: AwsArgs,

    #[command(flatten)]
    state: StateArgs,

    /// Validate configuration and print the plan without touching AWS
    #[arg(long)]
    dry_run: bool,
}

impl From<RunArgs> for config::RunConfig {
    fn from(args: RunArgs) -> Self {
        Self {
            pipeline: config::PipelineConfig {
                source_db: args.source_db,
                mode: args.mode,
                statements: split_statements(&args.sql, &args.sql_delimiter),
                share_accounts: split_list(&args.share_accounts),
                name_format: args.name_format,
                schedule: args.schedule,
            },
            network: NetworkConfig {
                db_subnet_group: args.db_subnet_group,
                security_group_ids: split_list(&args.db_security_groups),
                instance_class: args.instance_class,
            },
            sanitizer: args.sanitizer.into(),
            waits: args.waits.into(),
            aws: config::AwsConfig {
                region: args.aws.region,
                aws_profile: args.aws.aws_profile,
            },
            flags: config::RuntimeFlags {
                dry_run: args.dry_run,
                state_db: args.state.state_db,
            },
        }
    }
}

/// Arguments for the resume command
#[derive(clap::Args, Debug)]
struct ResumeArgs {
    /// Run to continue
    #[arg(long)]
    run_id: String,

    #[command(flatten)]
    sanitizer: SanitizerArgs,

    #[command(flatten)]
    waits: WaitArgs,

    #[command(flatten)]
    aws: AwsArgs,

    #[command(flatten)]
    state: StateArgs,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Produce a sanitized snapshot of a source database
    Run(Box<RunArgs>),

    /// Continue a run that was interrupted
    Resume(Box<ResumeArgs>),

    /// Show state, failure and history of a run
    Status {
        #[arg(long)]
        run_id: String,

        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,

        #[command(flatten)]
        state: StateArgs,
    },

    /// List recorded runs
    List {
        /// Maximum number of runs to show
        #[arg(long, default_value = "20")]
        limit: u32,

        #[command(flatten)]
        state: StateArgs,
    },

    /// Force-release the lock on a source database
    ReleaseLock {
        #[arg(long)]
        source_db: String,

        #[command(flatten)]
        state: StateArgs,
    },

    /// Scan AWS for ephemeral resources using tags
    Scan {
        #[command(flatten)]
        aws: AwsArgs,

        /// Only show resources older than N minutes
        #[arg(long, default_value = "10")]
        min_age_minutes: u32,

        /// Only show resources from a specific run ID
        #[arg(long)]
        run_id: Option<String>,

        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// Delete ephemeral resources left behind by crashed runs
    CleanupOrphans {
        #[command(flatten)]
        aws: AwsArgs,

        #[command(flatten)]
        state: StateArgs,

        /// Minimum age in minutes before considering a resource orphaned
        #[arg(long, default_value = "10")]
        min_age_minutes: u32,

        /// Only clean up resources from a specific run ID
        #[arg(long)]
        run_id: Option<String>,

        /// Actually delete resources (default is dry-run)
        #[arg(long)]
        execute: bool,

        /// Also delete resources of runs that have not finished
        #[arg(long)]
        force: bool,
    },

    /// Delete finished runs older than N days from the state database
    Prune {
        #[arg(long, default_value = "30")]
        days: u32,

        #[command(flatten)]
        state: StateArgs,
    },
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            print_error(&e);
            std::process::exit(EXIT_FAILED);
        }
    }
}

/// Print error in a user-friendly way
fn print_error(e: &anyhow::Error) {
    use std::io::Write;

    let mut stderr = std::io::stderr();

    let _ = writeln!(stderr, "\n\x1b[1;31mError:\x1b[0m {e}");

    let mut source = e.source();
    while let Some(cause) = source {
        let _ = writeln!(stderr, "  \x1b[33mCaused by:\x1b[0m {cause}");
        source = cause.source();
    }

    if let Some(hint) = rds_sanitizer::aws::classify_anyhow_error(e).hint() {
        let _ = writeln!(stderr, "\n\x1b[36mHint:\x1b[0m {hint}");
    }

    if std::env::var("RUST_BACKTRACE").is_err() {
        let _ = writeln!(
            stderr,
            "\n\x1b[2mSet RUST_BACKTRACE=1 for a detailed backtrace\x1b[0m"
        );
    } else {
        let backtrace = e.backtrace();
        if backtrace.status() == std::backtrace::BacktraceStatus::Captured {
            let _ = writeln!(stderr, "\n\x1b[2mBacktrace:\x1b[0m\n{backtrace}");
        }
    }
}

fn init_tracing() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    // Reduce noise from the AWS SDK
    for target in ["aws_config", "aws_sdk_rds", "aws_sdk_ecs", "aws_smithy_runtime"] {
        if let Ok(directive) = format!("{target}=warn").parse() {
            filter = filter.add_directive(directive);
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run() -> Result<i32> {
    let args = Args::parse();
    init_tracing();

    match args.command {
        Command::Run(run_args) => {
            let config: RunConfig = (*run_args).into();
            handle_run(config).await
        }
        Command::Resume(resume_args) => handle_resume(*resume_args).await,
        Command::Status {
            run_id,
            format,
            state,
        } => {
            let pool = open_db(state.state_db.as_deref()).await?;
            state::show_status(&pool, &run_id, matches!(format, OutputFormat::Json)).await?;
            Ok(0)
        }
        Command::List { limit, state } => {
            let pool = open_db(state.state_db.as_deref()).await?;
            state::list_runs_table(&pool, limit).await?;
            Ok(0)
        }
        Command::ReleaseLock { source_db, state } => {
            let pool = open_db(state.state_db.as_deref()).await?;
            state::release_lock(&pool, &source_db).await?;
            Ok(0)
        }
        Command::Scan {
            aws,
            min_age_minutes,
            run_id,
            format,
        } => {
            handle_scan(aws, min_age_minutes, run_id, format).await?;
            Ok(0)
        }
        Command::CleanupOrphans {
            aws,
            state,
            min_age_minutes,
            run_id,
            execute,
            force,
        } => {
            handle_cleanup_orphans(aws, state, min_age_minutes, run_id, execute, force).await?;
            Ok(0)
        }
        Command::Prune { days, state } => {
            let pool = open_db(state.state_db.as_deref()).await?;
            let summary = state::prune_database(&pool, days).await?;
            println!(
                "Pruned {} runs ({} resources, {} events)",
                summary.runs, summary.resources, summary.events
            );
            Ok(0)
        }
    }
}

/// Handle the run command
async fn handle_run(config: RunConfig) -> Result<i32> {
    config.validate()?;
    let ctx = RunContext::new(config.run_inputs(), config.name_format())
        .map_err(ConfigError::NameFormat)?;

    if config.dry_run() {
        print_plan(&config, &ctx);
        return Ok(0);
    }

    if let Some(profile) = config.aws_profile() {
        info!(profile = %profile, "Using AWS profile");
    }
    let aws = AwsContext::new(config.region(), config.aws_profile()).await;
    let store = RunStore::new(open_db(config.state_db()).await?, config.region());
    let control = RdsClient::from_context(&aws);
    let sanitizer = EcsSanitizer::new(&aws, config.sanitizer.clone());

    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());

    let outcome = RunEngine::new(&control, &sanitizer, &store, &config.waits, cancel)
        .start(ctx)
        .await?;
    Ok(report_outcome(&outcome))
}

/// Handle the resume command
async fn handle_resume(args: ResumeArgs) -> Result<i32> {
    let sanitizer_config: config::SanitizerConfig = args.sanitizer.into();
    let waits: config::WaitSettings = args.waits.into();

    let aws = AwsContext::new(&args.aws.region, args.aws.aws_profile.as_deref()).await;
    let store = RunStore::new(open_db(args.state.state_db.as_deref()).await?, &args.aws.region);
    let control = RdsClient::from_context(&aws);
    let sanitizer = EcsSanitizer::new(&aws, sanitizer_config);

    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());

    let outcome = RunEngine::new(&control, &sanitizer, &store, &waits, cancel)
        .resume(&args.run_id)
        .await?;
    Ok(report_outcome(&outcome))
}

fn print_plan(config: &RunConfig, ctx: &RunContext) {
    println!("\n=== Run Plan (dry run) ===");
    println!("Source database:   {}", ctx.inputs.source_db);
    println!("Snapshot mode:     {}", ctx.inputs.mode);
    if let Some(schedule) = &ctx.inputs.schedule {
        println!("Schedule:          {schedule}");
    }
    println!("Ephemeral instance: {}", ctx.instance_id);
    println!("Final snapshot:    {}", ctx.final_snapshot_id);
    println!(
        "Share with:        {}",
        if ctx.inputs.share_accounts.is_empty() {
            "-".to_string()
        } else {
            ctx.inputs.share_accounts.join(", ")
        }
    );
    println!("Region:            {}", config.region());
    println!("ECS cluster:       {}", config.sanitizer.cluster);
    println!("\nStatements ({}):", ctx.inputs.statements.len());
    for (i, statement) in ctx.inputs.statements.iter().enumerate() {
        println!("  {i:>3}: {statement}");
    }
}

/// Print the outcome of a run and map it to the process exit code
fn report_outcome(outcome: &RunOutcome) -> i32 {
    println!("\n=== Run {} ===", outcome.run_id);
    println!("State: {}", outcome.state);
    if let Some(snapshot) = &outcome.final_snapshot {
        println!("Final snapshot: {}", snapshot.identifier);
        if !snapshot.shared_with.is_empty() {
            println!("Shared with:    {}", snapshot.shared_with.join(", "));
        }
    }
    if let Some(failure) = &outcome.failure {
        println!("Failed in {} ({}): {}", failure.step, failure.kind, failure.message);
        for share in &failure.failed_accounts {
            println!("  {}: {}", share.account, share.reason);
        }
    }
    if let Some(error) = &outcome.cleanup_error {
        println!("Cleanup incomplete: {error}");
        println!("Run `rds-sanitizer cleanup-orphans --execute` once the cause is fixed.");
    }

    match outcome.state {
        RunState::Succeeded => 0,
        RunState::CleanupFailed => EXIT_CLEANUP_FAILED,
        _ => EXIT_FAILED,
    }
}

/// Handle the scan command
async fn handle_scan(
    aws: AwsArgs,
    min_age_minutes: u32,
    run_id: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    info!(region = %aws.region, min_age_minutes, run_id = ?run_id, "Scanning for ephemeral resources");

    let ctx = AwsContext::new(&aws.region, aws.aws_profile.as_deref()).await;
    let scanner = ResourceScanner::from_context(&ctx);
    let config = ScanConfig {
        min_age: chrono::Duration::minutes(i64::from(min_age_minutes)),
        run_id,
    };

    let resources = scanner.scan_all(&config).await?;

    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&resources).context("Failed to serialize resources")?
            );
        }
        OutputFormat::Table => {
            if resources.is_empty() {
                println!("No ephemeral resources found matching criteria.");
                return Ok(());
            }
            let mut table = Table::new();
            table.load_preset(UTF8_FULL_CONDENSED).set_header(vec![
                "Kind", "Resource", "Run", "Source", "Created", "Status",
            ]);
            for r in &resources {
                table.add_row(vec![
                    r.kind.to_string(),
                    r.resource_id.clone(),
                    r.run_id.clone(),
                    r.source_db.clone().unwrap_or_else(|| "-".to_string()),
                    r.created_at
                        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    r.status.clone(),
                ]);
            }
            println!("{table}");
            println!("\nTotal: {} resources", resources.len());
        }
    }

    Ok(())
}

/// Handle the cleanup-orphans command
async fn handle_cleanup_orphans(
    aws: AwsArgs,
    state: StateArgs,
    min_age_minutes: u32,
    run_id: Option<String>,
    execute: bool,
    force: bool,
) -> Result<()> {
    let mode = if execute { "EXECUTE" } else { "DRY-RUN" };
    info!(
        region = %aws.region,
        min_age_minutes,
        run_id = ?run_id,
        mode,
        force,
        "Cleaning up orphaned resources"
    );

    let ctx = AwsContext::new(&aws.region, aws.aws_profile.as_deref()).await;
    let store = RunStore::new(open_db(state.state_db.as_deref()).await?, &aws.region);
    let scan = ScanConfig {
        min_age: chrono::Duration::minutes(i64::from(min_age_minutes)),
        run_id: run_id.clone(),
    };
    let discovered = ResourceScanner::from_context(&ctx).scan_all(&scan).await?;

    let mut candidates = collect_candidates(&store, &discovered).await?;
    if let Some(run_id) = &run_id {
        candidates.retain(|c| &c.run_id == run_id);
    }

    let config = CleanupConfig {
        dry_run: !execute,
        force,
    };
    let control = RdsClient::from_context(&ctx);
    let wait = config::WaitSettings::default().cleanup();
    let report = cleanup_orphans(&control, &store, &candidates, &config, &wait).await?;

    println!("\n=== Cleanup Report ===");
    println!("Mode: {}", mode);
    println!("Region: {}", aws.region);
    println!();
    println!("Resources found: {}", report.total_found);
    for c in &candidates {
        println!("  {:<12} {} (run {}, {})", c.kind, c.resource_id, c.run_id, c.origin);
    }
    println!("Active runs:     {} (use --force to include)", report.active);
    println!();
    if execute {
        println!("Deleted:      {}", report.deleted);
        println!("Already gone: {}", report.already_gone);
        println!("Failed:       {}", report.failed.len());
        for (resource, error) in &report.failed {
            println!("  {resource}: {error}");
        }
    } else {
        println!("Skipped: {} (dry-run mode)", report.skipped);
        println!();
        println!("Run with --execute to actually delete resources.");
    }

    Ok(())
}
