//! Shared test utilities for rds-sanitizer
//!
//! Helpers used by unit and integration tests of the coordinator crate,
//! kept separate so the coordinator does not carry them in its build.
//!
//! ## Modules
//!
//! - [`aws`]: AWS region detection, integration test fixtures, test run IDs
//! - [`db`]: In-memory SQLite pools

pub mod aws;
pub mod db;

// Re-export commonly used items
pub use aws::{get_test_region, integration_source_db, test_identifier, test_run_id};
pub use db::{open_named_test_db, open_test_db};
