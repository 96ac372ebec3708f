//! rds-sanitizer-common - Shared types and utilities
//!
//! This crate provides the types shared by the coordinator and its tests,
//! without any AWS SDK dependencies to keep it lightweight.
//!
//! ## Modules
//!
//! - [`defaults`]: Default configuration values
//! - [`engine`]: Supported database engines and their per-engine rules
//! - [`name_format`]: Final snapshot name formats and RDS identifier rules
//! - [`resource_kind`]: Ephemeral resource kinds and cleanup ordering
//! - [`run_id`]: Run identifiers
//! - [`schedule`]: Schedule expression validation
//! - [`statements`]: Splitting of delimited statement and account lists
//! - [`tags`]: AWS resource tag constants for discovery and cleanup

pub mod defaults;
pub mod engine;
pub mod name_format;
pub mod resource_kind;
pub mod run_id;
pub mod schedule;
pub mod statements;
pub mod tags;

// Re-export commonly used types
pub use engine::{ConnectionInfo, CredentialPolicy, EngineKind, UnsupportedEngine};
pub use name_format::{NameFormatError, SnapshotNameFormat, ephemeral_identifier, validate_identifier};
pub use resource_kind::ResourceKind;
pub use run_id::{RunId, random_token};
pub use schedule::{RateUnit, ScheduleError, ScheduleExpression};
pub use statements::{split_list, split_statements};
