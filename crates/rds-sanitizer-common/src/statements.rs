//! Splitting of delimited statement and account lists
//!
//! Statements are opaque: they are split on the delimiter and trimmed, and
//! nothing else. A delimiter inside a quoted literal still splits.

/// Split raw sanitization SQL into individual statements, in order
///
/// Empty fragments (blank lines, a trailing delimiter) are dropped.
pub fn split_statements(raw: &str, delimiter: &str) -> Vec<String> {
    if delimiter.is_empty() {
        let trimmed = raw.trim();
        return if trimmed.is_empty() {
            Vec::new()
        } else {
            vec![trimmed.to_string()]
        };
    }
    raw.split(delimiter)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split a comma separated list, dropping blanks
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
