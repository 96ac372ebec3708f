//! Final snapshot name formats and RDS identifier rules
//!
//! A name format is a template with substitution tokens:
//!
//! | Token | Expands to |
//! |-------|------------|
//! | `{database_identifier}` | Source database identifier |
//! | `{database_identifier:.N}` | Same, truncated to N characters |
//! | `{date}` | Run start date, `%Y-%m-%d` |
//! | `{date:FMT}` | Run start time in strftime format `FMT` |
//! | `{run_id}` | Run identifier |
//!
//! `{{` and `}}` produce literal braces. A format must contain `{date}` or
//! `{run_id}` so that successive runs produce distinct names.

use std::str::FromStr;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::defaults::{IDENTIFIER_PREFIX_LEN, IDENTIFIER_TOKEN_LEN};

/// Maximum length of an RDS instance or snapshot identifier
pub const MAX_IDENTIFIER_LEN: usize = 63;

const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NameFormatError {
    #[error("unknown token '{{{0}}}' in snapshot name format")]
    UnknownToken(String),

    #[error("invalid option '{option}' for token '{token}'")]
    InvalidOption { token: String, option: String },

    #[error("unbalanced brace at position {0} in snapshot name format")]
    UnbalancedBrace(usize),

    #[error("snapshot name format must contain {{date}} or {{run_id}} so names differ between runs")]
    MissingUniquenessToken,

    #[error("invalid identifier '{identifier}': {reason}")]
    InvalidIdentifier { identifier: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    DatabaseIdentifier { max_len: Option<usize> },
    Date { format: String },
    RunId,
}

/// Parsed final snapshot name template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotNameFormat {
    raw: String,
    segments: Vec<Segment>,
}

impl SnapshotNameFormat {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Expand the template for one run
    ///
    /// The result is validated as an RDS identifier; a format that expands
    /// to an invalid identifier is rejected here rather than by the
    /// control plane after the instance has already been provisioned.
    pub fn render(
        &self,
        database_identifier: &str,
        at: DateTime<Utc>,
        run_id: &str,
    ) -> Result<String, NameFormatError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::DatabaseIdentifier { max_len } => match max_len {
                    Some(n) => out.extend(database_identifier.chars().take(*n)),
                    None => out.push_str(database_identifier),
                },
                Segment::Date { format } => out.push_str(&at.format(format).to_string()),
                Segment::RunId => out.push_str(run_id),
            }
        }
        validate_identifier(&out)?;
        Ok(out)
    }
}

impl FromStr for SnapshotNameFormat {
    type Err = NameFormatError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = raw.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if chars.peek().map(|(_, n)| *n) == Some('{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek().map(|(_, n)| *n) == Some('}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(NameFormatError::UnbalancedBrace(pos)),
                '{' => {
                    let mut token = String::new();
                    let mut closed = false;
                    for (_, t) in chars.by_ref() {
                        if t == '}' {
                            closed = true;
                            break;
                        }
                        token.push(t);
                    }
                    if !closed {
                        return Err(NameFormatError::UnbalancedBrace(pos));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(parse_token(&token)?);
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        if !segments
            .iter()
            .any(|s| matches!(s, Segment::Date { .. } | Segment::RunId))
        {
            return Err(NameFormatError::MissingUniquenessToken);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }
}

impl std::fmt::Display for SnapshotNameFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

fn parse_token(token: &str) -> Result<Segment, NameFormatError> {
    let (name, option) = match token.split_once(':') {
        Some((name, option)) => (name, Some(option)),
        None => (token, None),
    };
    let invalid = |option: &str| NameFormatError::InvalidOption {
        token: name.to_string(),
        option: option.to_string(),
    };

    match (name, option) {
        ("database_identifier", None) => Ok(Segment::DatabaseIdentifier { max_len: None }),
        ("database_identifier", Some(option)) => {
            let max_len = option
                .strip_prefix('.')
                .and_then(|n| n.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .ok_or_else(|| invalid(option))?;
            Ok(Segment::DatabaseIdentifier {
                max_len: Some(max_len),
            })
        }
        ("date", None) => Ok(Segment::Date {
            format: DEFAULT_DATE_FORMAT.to_string(),
        }),
        ("date", Some(option)) => {
            if option.is_empty() || StrftimeItems::new(option).any(|i| matches!(i, Item::Error)) {
                return Err(invalid(option));
            }
            Ok(Segment::Date {
                format: option.to_string(),
            })
        }
        ("run_id", None) => Ok(Segment::RunId),
        ("run_id", Some(option)) => Err(invalid(option)),
        _ => Err(NameFormatError::UnknownToken(token.to_string())),
    }
}

/// Check the control plane's identifier rules
///
/// 1 to 63 characters, ASCII letters, digits and hyphens, starting with a
/// letter, no two consecutive hyphens and no trailing hyphen.
pub fn validate_identifier(identifier: &str) -> Result<(), NameFormatError> {
    let fail = |reason: &str| {
        Err(NameFormatError::InvalidIdentifier {
            identifier: identifier.to_string(),
            reason: reason.to_string(),
        })
    };

    if identifier.is_empty() {
        return fail("must not be empty");
    }
    if identifier.len() > MAX_IDENTIFIER_LEN {
        return fail("must be at most 63 characters");
    }
    if !identifier.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return fail("must start with a letter");
    }
    if !identifier
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return fail("may only contain letters, digits and hyphens");
    }
    if identifier.contains("--") {
        return fail("must not contain two consecutive hyphens");
    }
    if identifier.ends_with('-') {
        return fail("must not end with a hyphen");
    }
    Ok(())
}

/// Identifier for an ephemeral resource derived from the source identifier
///
/// The source identifier is cut to leave room for `-<token>` and trailing
/// hyphens are dropped so the result stays valid.
pub fn ephemeral_identifier(source: &str, token: &str) -> String {
    let prefix: String = source.chars().take(IDENTIFIER_PREFIX_LEN).collect();
    let token: String = token.chars().take(IDENTIFIER_TOKEN_LEN).collect();
    format!("{}-{}", prefix.trim_end_matches('-'), token)
}
