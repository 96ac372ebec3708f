//! Supported database engines and their per-engine rules
//!
//! The set is closed: PostgreSQL, MySQL and MariaDB. Each engine decides how
//! the sanitizer connects, which client command runs the statements, and
//! what a valid master password looks like.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Prefix of the progress markers printed before each sanitization statement
pub const STATEMENT_MARKER: &str = "rds-sanitizer:statement:";

/// Seconds the SQL client waits for a connection before giving up
pub const CONNECT_TIMEOUT_SECS: u32 = 30;

/// Database engine of the source database
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EngineKind {
    Postgres,
    MySql,
    MariaDb,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unsupported database engine '{0}' (supported: postgres, mysql, mariadb)")]
pub struct UnsupportedEngine(pub String);

/// Connection parameters of the ephemeral instance
///
/// Never contains the password; that is handed to the sanitizer separately
/// and is not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub database: Option<String>,
}

/// Master password rules the control plane enforces for an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialPolicy {
    /// Length of generated passwords
    pub length: usize,
    pub min_length: usize,
    pub max_length: usize,
    /// Printable characters the engine rejects in a master password
    pub forbidden: &'static [char],
}

const RDS_FORBIDDEN_PASSWORD_CHARS: &[char] = &['/', '\'', '"', '@', ' '];

impl CredentialPolicy {
    pub fn allows(&self, password: &str) -> bool {
        let len = password.chars().count();
        len >= self.min_length
            && len <= self.max_length
            && password
                .chars()
                .all(|c| c.is_ascii_graphic() && !self.forbidden.contains(&c))
    }
}

impl EngineKind {
    /// Map the engine string reported by the control plane
    pub fn from_rds_engine(engine: &str) -> Result<Self, UnsupportedEngine> {
        match engine {
            "postgres" => Ok(Self::Postgres),
            "mysql" => Ok(Self::MySql),
            "mariadb" => Ok(Self::MariaDb),
            other => Err(UnsupportedEngine(other.to_string())),
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Postgres => 5432,
            Self::MySql | Self::MariaDb => 3306,
        }
    }

    pub fn credential_policy(self) -> CredentialPolicy {
        match self {
            Self::Postgres => CredentialPolicy {
                length: 64,
                min_length: 8,
                max_length: 128,
                forbidden: RDS_FORBIDDEN_PASSWORD_CHARS,
            },
            Self::MySql | Self::MariaDb => CredentialPolicy {
                length: 40,
                min_length: 8,
                max_length: 41,
                forbidden: RDS_FORBIDDEN_PASSWORD_CHARS,
            },
        }
    }

    /// Environment handed to the sanitizer container
    ///
    /// Postgres takes everything from the libpq variables; the MySQL client
    /// only reads host, port and password from its environment, the rest
    /// goes on the command line (see [`EngineKind::sanitizer_command`]).
    pub fn connection_env(self, conn: &ConnectionInfo, password: &str) -> Vec<(String, String)> {
        let pairs: Vec<(&str, String)> = match self {
            Self::Postgres => vec![
                ("PGHOST", conn.host.clone()),
                ("PGPORT", conn.port.to_string()),
                ("PGUSER", conn.username.clone()),
                ("PGPASSWORD", password.to_string()),
                (
                    "PGDATABASE",
                    conn.database.clone().unwrap_or_else(|| "postgres".to_string()),
                ),
                ("PGCONNECT_TIMEOUT", CONNECT_TIMEOUT_SECS.to_string()),
            ],
            Self::MySql | Self::MariaDb => vec![
                ("MYSQL_HOST", conn.host.clone()),
                ("MYSQL_TCP_PORT", conn.port.to_string()),
                ("MYSQL_PWD", password.to_string()),
            ],
        };
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    /// Client command executing `statements` in order, stopping at the
    /// first failure
    ///
    /// A marker line `rds-sanitizer:statement:<index>` is printed before
    /// each statement, so the log of a failed run tells which statement
    /// failed (see [`failed_statement_index`]).
    pub fn sanitizer_command(self, conn: &ConnectionInfo, statements: &[String]) -> Vec<String> {
        match self {
            Self::Postgres => {
                let mut cmd = vec![
                    "psql".to_string(),
                    "--no-psqlrc".to_string(),
                    "--set".to_string(),
                    "ON_ERROR_STOP=1".to_string(),
                ];
                for (index, statement) in statements.iter().enumerate() {
                    cmd.push("-c".to_string());
                    cmd.push(format!("\\echo {STATEMENT_MARKER}{index}"));
                    cmd.push("-c".to_string());
                    cmd.push(statement.clone());
                }
                cmd
            }
            Self::MySql | Self::MariaDb => {
                let mut cmd = vec![
                    "mysql".to_string(),
                    "--batch".to_string(),
                    "--skip-column-names".to_string(),
                    format!("--connect-timeout={CONNECT_TIMEOUT_SECS}"),
                    format!("--user={}", conn.username),
                ];
                if let Some(database) = &conn.database {
                    cmd.push(format!("--database={database}"));
                }
                let mut script = String::new();
                for (index, statement) in statements.iter().enumerate() {
                    script.push_str(&format!("SELECT '{STATEMENT_MARKER}{index}';\n"));
                    script.push_str(statement);
                    script.push_str(";\n");
                }
                cmd.push("-e".to_string());
                cmd.push(script);
                cmd
            }
        }
    }
}

/// Index of the statement that was running when the sanitizer stopped
///
/// This is the last marker printed in the log. `None` when no marker was
/// printed, i.e. the client failed before running anything (typically a
/// connection error).
pub fn failed_statement_index<'a>(lines: impl IntoIterator<Item = &'a str>) -> Option<usize> {
    lines
        .into_iter()
        .filter_map(|line| line.trim().strip_prefix(STATEMENT_MARKER))
        .filter_map(|rest| rest.trim().parse::<usize>().ok())
        .last()
}
