//! rds-sanitizer - sanitized, shareable RDS snapshots
//!
//! This crate provides the coordinator that restores a production snapshot
//! into an ephemeral instance, runs sanitization SQL against it from an ECS
//! task, snapshots and shares the result, and cleans up after itself.

pub mod aws;
pub mod config;
pub mod credential;
pub mod pipeline;
pub mod shutdown;
pub mod state;
pub mod wait;

#[cfg(test)]
mod testing;
