//! AWS resource tag constants for rds-sanitizer
//!
//! Every instance and snapshot a run creates carries these tags so that
//! orphans left by a crashed coordinator can be discovered and removed.
//!
//! ## Tag Schema
//!
//! | Tag Key | Description |
//! |---------|-------------|
//! | `rds-sanitizer:tool` | Static identifier ("rds-sanitizer") |
//! | `rds-sanitizer:run-id` | Run identifier (ephemeral resources only) |
//! | `rds-sanitizer:created-at` | RFC 3339 creation timestamp |
//! | `rds-sanitizer:source` | Source database identifier |
//!
//! The final sanitized snapshot carries the tool and source tags but not the
//! run ID, so cleanup by run ID can never select it.

/// Tag key for tool identification - all rds-sanitizer resources have this
pub const TAG_TOOL: &str = "rds-sanitizer:tool";

/// Tag value for tool identification
pub const TAG_TOOL_VALUE: &str = "rds-sanitizer";

/// Tag key for run ID - only present on ephemeral resources
pub const TAG_RUN_ID: &str = "rds-sanitizer:run-id";

/// Tag key for creation timestamp (RFC 3339 format)
pub const TAG_CREATED_AT: &str = "rds-sanitizer:created-at";

/// Tag key for the source database identifier
pub const TAG_SOURCE: &str = "rds-sanitizer:source";

/// Helper to format creation timestamp for tags
pub fn format_created_at(time: chrono::DateTime<chrono::Utc>) -> String {
    time.to_rfc3339()
}

/// Helper to parse creation timestamp from tags
pub fn parse_created_at(s: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&chrono::Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_parse_created_at() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(parse_created_at(&format_created_at(at)), Some(at));
        assert_eq!(
            parse_created_at("2024-03-01T14:30:00+02:00"),
            Some(at),
            "offsets are normalized to UTC"
        );
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_created_at("not a timestamp").is_none());
        assert!(parse_created_at("").is_none());
    }
}
