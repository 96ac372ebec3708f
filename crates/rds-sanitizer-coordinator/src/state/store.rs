//! Run persistence as used by the pipeline

use anyhow::Result;
use rds_sanitizer_common::ResourceKind;

use super::crud;
use super::db::DbPool;
use super::lock::{self, LockOutcome};
use super::queries;
use super::types::StoredRun;
use crate::pipeline::{RunContext, RunState};

/// State database handle bound to the region runs execute in
#[derive(Debug, Clone)]
pub struct RunStore {
    pool: DbPool,
    region: String,
}

impl RunStore {
    pub fn new(pool: DbPool, region: impl Into<String>) -> Self {
        Self {
            pool,
            region: region.into(),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub async fn insert_run(&self, ctx: &RunContext, state: RunState) -> Result<()> {
        crud::insert_run(&self.pool, ctx, state, &self.region).await
    }

    pub async fn save_run(&self, ctx: &RunContext, state: RunState) -> Result<()> {
        crud::save_run(&self.pool, ctx, state).await
    }

    pub async fn save_context(&self, ctx: &RunContext) -> Result<()> {
        crud::save_context(&self.pool, ctx).await
    }

    pub async fn load_run(&self, run_id: &str) -> Result<Option<StoredRun>> {
        queries::load_run(&self.pool, run_id).await
    }

    pub async fn record_resource(
        &self,
        run_id: &str,
        kind: ResourceKind,
        resource_id: &str,
    ) -> Result<()> {
        crud::insert_resource(&self.pool, run_id, kind, resource_id, &self.region).await
    }

    pub async fn mark_resource_deleted(&self, kind: ResourceKind, resource_id: &str) -> Result<()> {
        crud::mark_resource_deleted(&self.pool, kind, resource_id).await
    }

    pub async fn append_event(
        &self,
        run_id: &str,
        from: Option<RunState>,
        to: RunState,
        message: &str,
    ) -> Result<()> {
        crud::insert_event(&self.pool, run_id, from, to, message).await
    }

    pub async fn acquire_lock(&self, source_db: &str, run_id: &str) -> Result<LockOutcome> {
        lock::acquire(&self.pool, source_db, run_id).await
    }

    pub async fn release_lock(&self, source_db: &str, run_id: &str) -> Result<bool> {
        lock::release(&self.pool, source_db, run_id).await
    }

    #[cfg(test)]
    pub(crate) async fn open_test() -> Result<Self> {
        Ok(Self::new(super::db::open_test_db().await?, "us-east-2"))
    }
}
