//! SQLite state for runs, their ephemeral resources and source locks
//!
//! Uses sqlx for async database access with a connection pool.

mod cli;
mod crud;
mod db;
mod lock;
mod queries;
mod store;
mod types;

// Re-export types
pub use db::{DbPool, open_db};
pub use lock::LockOutcome;
pub use store::RunStore;
pub use types::{EventRecord, RunRecord, StoredRun, TrackedResource};

// Re-export query operations
pub use lock::force_release;
pub use queries::{get_run_events, get_run_resources, get_undeleted_resources, list_runs, load_run};

// Re-export CLI operations
pub use cli::{PruneSummary, list_runs_table, prune_database, release_lock, show_status};
