//! AWS client modules for the coordinator
//!
//! This module provides wrappers around AWS SDK clients for:
//! - RDS: the control plane for instances and snapshots
//! - ECS: the sanitizer task runtime
//! - CloudWatch Logs: sanitizer output
//! - STS: Account ID lookup
//! - scanner/cleanup: tag-based discovery and removal of orphans

pub mod account;
pub mod cleanup;
pub mod context;
pub mod ecs;
pub mod error;
pub mod logs;
pub mod rds;
mod retry;
pub mod scanner;
pub mod tags;

// Core clients
pub use account::{AccountId, InvalidAccountId, get_current_account_id};
pub use context::{AwsContext, FromAwsContext};
pub use ecs::EcsSanitizer;
pub use logs::LogReader;
pub use rds::RdsClient;

// Error handling
pub use error::{AwsError, classify_anyhow_error, classify_aws_error, is_not_found, is_retryable};

// Orphan discovery and cleanup
pub use cleanup::{CleanupConfig, OrphanCandidate, OrphanReport, cleanup_orphans, collect_candidates};
pub use scanner::{DiscoveredResource, ResourceScanner, ScanConfig};
