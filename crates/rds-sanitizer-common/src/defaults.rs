//! Default configuration values
//!
//! Wait bounds follow the control plane's typical latencies: snapshots can
//! take hours on large databases, instance restores and credential changes
//! usually minutes.

/// Default statement delimiter for the sanitization SQL
pub const DEFAULT_SQL_DELIMITER: &str = ";";

/// Default final snapshot name format
pub const DEFAULT_SNAPSHOT_NAME_FORMAT: &str =
    "{database_identifier:.42}-sanitized-{date:%Y-%m-%d}";

/// Default schedule expression (recorded with each run, executed externally)
pub const DEFAULT_SCHEDULE: &str = "rate(7 days)";

/// Default AWS region
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default sanitizer container name inside the task definition
pub const DEFAULT_CONTAINER_NAME: &str = "sql";

/// Default CloudWatch log stream prefix of the sanitizer container
pub const DEFAULT_LOG_STREAM_PREFIX: &str = "sql";

/// Initial delay between status polls (seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Maximum delay between status polls (seconds)
pub const DEFAULT_MAX_POLL_INTERVAL_SECS: u64 = 60;

/// Wait bound for snapshot creation (24 hours)
pub const DEFAULT_SNAPSHOT_TIMEOUT_SECS: u64 = 24 * 3600;

/// Wait bound for instance restore and credential propagation (5 hours)
pub const DEFAULT_INSTANCE_TIMEOUT_SECS: u64 = 5 * 3600;

/// Wait bound for the sanitizer task (4 hours)
pub const DEFAULT_SANITIZE_TIMEOUT_SECS: u64 = 4 * 3600;

/// Wait bound for deletion of ephemeral resources (2 hours)
pub const DEFAULT_CLEANUP_TIMEOUT_SECS: u64 = 2 * 3600;

/// Maximum length of the source identifier kept in derived identifiers
///
/// Leaves room for `-` and the token within the 63 character limit.
pub const IDENTIFIER_PREFIX_LEN: usize = 52;

/// Number of hex characters in the run-unique identifier suffix
pub const IDENTIFIER_TOKEN_LEN: usize = 10;
