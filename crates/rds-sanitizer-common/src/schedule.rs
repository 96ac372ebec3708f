//! Schedule expression validation
//!
//! Runs are triggered by an external scheduler; the coordinator only
//! validates and records the expression. Accepted forms:
//!
//! - `rate(N unit)` with unit minute(s), hour(s) or day(s); singular iff N == 1
//! - `cron(min hour day-of-month month day-of-week year)`
//! - a bare five-field cron expression

use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid rate expression '{0}': expected rate(<positive number> <minute|hour|day>[s])")]
    InvalidRate(String),

    #[error("invalid cron expression '{expression}': expected {expected} fields, found {found}")]
    CronFieldCount {
        expression: String,
        expected: usize,
        found: usize,
    },

    #[error("invalid cron field '{0}'")]
    InvalidCronField(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleExpression {
    Rate { value: u32, unit: RateUnit },
    Cron { fields: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum RateUnit {
    Minute,
    Hour,
    Day,
}

impl FromStr for ScheduleExpression {
    type Err = ScheduleError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if let Some(body) = raw.strip_prefix("rate(").and_then(|r| r.strip_suffix(')')) {
            return parse_rate(body).ok_or_else(|| ScheduleError::InvalidRate(raw.to_string()));
        }
        if let Some(body) = raw.strip_prefix("cron(").and_then(|r| r.strip_suffix(')')) {
            return parse_cron(raw, body, 6);
        }
        parse_cron(raw, raw, 5)
    }
}

impl std::fmt::Display for ScheduleExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rate { value, unit } => {
                let plural = if *value == 1 { "" } else { "s" };
                write!(f, "rate({value} {unit}{plural})")
            }
            Self::Cron { fields } if fields.len() == 6 => write!(f, "cron({})", fields.join(" ")),
            Self::Cron { fields } => f.write_str(&fields.join(" ")),
        }
    }
}

fn parse_rate(body: &str) -> Option<ScheduleExpression> {
    let (value, unit) = body.trim().split_once(' ')?;
    let value: u32 = value.parse().ok().filter(|v| *v > 0)?;
    let unit = match (unit.trim(), value == 1) {
        ("minute", true) | ("minutes", false) => RateUnit::Minute,
        ("hour", true) | ("hours", false) => RateUnit::Hour,
        ("day", true) | ("days", false) => RateUnit::Day,
        _ => return None,
    };
    Some(ScheduleExpression::Rate { value, unit })
}

fn parse_cron(raw: &str, body: &str, expected: usize) -> Result<ScheduleExpression, ScheduleError> {
    let fields: Vec<String> = body.split_whitespace().map(str::to_string).collect();
    if fields.len() != expected {
        return Err(ScheduleError::CronFieldCount {
            expression: raw.to_string(),
            expected,
            found: fields.len(),
        });
    }
    for field in &fields {
        let valid = field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '*' | ',' | '-' | '/' | '?' | '#'));
        if !valid {
            return Err(ScheduleError::InvalidCronField(field.clone()));
        }
    }
    Ok(ScheduleExpression::Cron { fields })
}
