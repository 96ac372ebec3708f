//! Orphan cleanup
//!
//! Removes ephemeral resources left behind by runs that did not finish
//! their own cleanup: resources still recorded as present in the state
//! database, plus tagged resources found by the scanner that the database
//! never saw. Resources of runs that are still active are left alone unless
//! forced, since those runs can be resumed.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use rds_sanitizer_common::ResourceKind;
use tracing::{info, warn};

use super::scanner::DiscoveredResource;
use crate::pipeline::{ControlPlane, DeleteOutcome, delete_and_wait};
use crate::state::{RunStore, get_undeleted_resources};
use crate::wait::WaitConfig;

/// Cleanup configuration
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Actually delete resources (false = dry run)
    pub dry_run: bool,
    /// Also delete resources of runs that are not finished
    pub force: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            force: false,
        }
    }
}

/// Where an orphan candidate was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Origin {
    StateDb,
    Tags,
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanCandidate {
    pub kind: ResourceKind,
    pub resource_id: String,
    pub run_id: String,
    pub origin: Origin,
}

/// Report of cleanup operations
#[derive(Debug, Default)]
pub struct OrphanReport {
    pub total_found: usize,
    pub deleted: usize,
    pub already_gone: usize,
    /// Would have been deleted (dry run)
    pub skipped: usize,
    /// Belong to runs that are still active
    pub active: usize,
    pub failed: Vec<(String, String)>,
}

/// Merge recorded and discovered resources, keyed by kind and identifier
pub async fn collect_candidates(
    store: &RunStore,
    discovered: &[DiscoveredResource],
) -> Result<Vec<OrphanCandidate>> {
    let mut candidates: BTreeMap<(u8, String), OrphanCandidate> = BTreeMap::new();

    for r in get_undeleted_resources(store.pool()).await? {
        if r.region != store.region() {
            continue;
        }
        candidates.insert(
            (r.kind.cleanup_priority(), r.resource_id.clone()),
            OrphanCandidate {
                kind: r.kind,
                resource_id: r.resource_id,
                run_id: r.run_id,
                origin: Origin::StateDb,
            },
        );
    }

    for r in discovered {
        candidates
            .entry((r.kind.cleanup_priority(), r.resource_id.clone()))
            .and_modify(|c| c.origin = Origin::Both)
            .or_insert_with(|| OrphanCandidate {
                kind: r.kind,
                resource_id: r.resource_id.clone(),
                run_id: r.run_id.clone(),
                origin: Origin::Tags,
            });
    }

    // BTreeMap order puts instances before snapshots
    Ok(candidates.into_values().collect())
}

/// Delete orphan candidates, instances first
pub async fn cleanup_orphans<C: ControlPlane>(
    control: &C,
    store: &RunStore,
    candidates: &[OrphanCandidate],
    config: &CleanupConfig,
    wait: &WaitConfig,
) -> Result<OrphanReport> {
    let mut report = OrphanReport {
        total_found: candidates.len(),
        ..Default::default()
    };
    let mut active_runs: HashMap<&str, bool> = HashMap::new();

    for candidate in candidates {
        let run_id = candidate.run_id.as_str();
        let active = match active_runs.get(run_id) {
            Some(active) => *active,
            None => {
                let active = store
                    .load_run(run_id)
                    .await?
                    .is_some_and(|r| !r.record.state.is_terminal());
                active_runs.insert(run_id, active);
                active
            }
        };
        if active && !config.force {
            info!(
                kind = %candidate.kind,
                resource = %candidate.resource_id,
                run_id,
                "Skipping resource of active run"
            );
            report.active += 1;
            continue;
        }

        if config.dry_run {
            info!(
                kind = %candidate.kind,
                resource = %candidate.resource_id,
                origin = %candidate.origin,
                "[DRY RUN] Would delete"
            );
            report.skipped += 1;
            continue;
        }

        match delete_and_wait(control, candidate.kind, &candidate.resource_id, wait).await {
            Ok(outcome) => {
                info!(
                    kind = %candidate.kind,
                    resource = %candidate.resource_id,
                    outcome = %outcome,
                    "Orphan removed"
                );
                match outcome {
                    DeleteOutcome::Deleted => report.deleted += 1,
                    DeleteOutcome::AlreadyGone => report.already_gone += 1,
                }
                if let Err(e) = store
                    .mark_resource_deleted(candidate.kind, &candidate.resource_id)
                    .await
                {
                    warn!(resource = %candidate.resource_id, error = %e, "Failed to record deletion");
                }
            }
            Err(e) => {
                warn!(
                    kind = %candidate.kind,
                    resource = %candidate.resource_id,
                    error = %e,
                    "Failed to delete orphan"
                );
                report
                    .failed
                    .push((format!("{} {}", candidate.kind, candidate.resource_id), e.to_string()));
            }
        }
    }

    Ok(report)
}
