//! AWS test utilities
//!
//! Region detection, fixture lookup and unique names for the ignored
//! integration tests that run against a real account.

use chrono::Utc;

/// Environment variable naming the source database used by integration tests
pub const SOURCE_DB_ENV: &str = "RDS_SANITIZER_TEST_SOURCE_DB";

/// Get the AWS region for tests.
///
/// Checks `AWS_REGION`, then `AWS_DEFAULT_REGION`, then falls back to
/// us-east-1.
pub fn get_test_region() -> String {
    std::env::var("AWS_REGION")
        .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
        .unwrap_or_else(|_| "us-east-1".to_string())
}

/// Source database identifier for integration tests, if configured
///
/// Integration tests call this first and return early when it is unset,
/// so an accidental `--ignored` run without a fixture does nothing.
pub fn integration_source_db() -> Option<String> {
    std::env::var(SOURCE_DB_ENV).ok().filter(|s| !s.is_empty())
}

/// Generate a unique run ID for test resources.
///
/// Format: `test-{timestamp_ms}-{counter}`, unique even when tests start
/// in the same millisecond.
pub fn test_run_id() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let ts = Utc::now().timestamp_millis();
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("test-{}-{}", ts, counter)
}

/// Unique RDS identifier for a test resource, starting with `prefix`
///
/// Satisfies the control plane's identifier rules as long as `prefix`
/// starts with a letter and does not end with a hyphen.
pub fn test_identifier(prefix: &str) -> String {
    format!("{}-{}", prefix, test_run_id())
}
