//! Database test utilities
//!
//! Provides in-memory SQLite database setup for testing.
//!
//! Schema setup is done by the consuming crate since the schema lives in
//! the coordinator.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// Create an in-memory SQLite connection pool for testing.
///
/// The pool holds a single connection: every connection to `:memory:` is
/// its own database, so a second one would not see the schema.
pub async fn open_test_db() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Create a shared-cache in-memory pool with several connections.
///
/// Pools opened with the same `name` see the same database, which lets
/// tests exercise two coordinators contending for the same state (run
/// locks in particular).
pub async fn open_named_test_db(name: &str) -> Result<SqlitePool> {
    let uri = format!("sqlite:file:{}?mode=memory&cache=shared", name);
    let options = SqliteConnectOptions::from_str(&uri)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}
