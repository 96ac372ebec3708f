//! Run state machine
//!
//! The happy path is strictly linear. Failures in any state that may have
//! created an ephemeral resource route through `CleaningUp`; `CleaningUp`
//! ends in the terminal matching the original outcome, or in
//! `CleanupFailed` when resources could not be removed.

use serde::{Deserialize, Serialize};

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
    strum::EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum RunState {
    LocatingSnapshot,
    ProvisioningInstance,
    AwaitingInstanceReady,
    ResettingCredential,
    AwaitingCredentialApplied,
    Sanitizing,
    FinalizingSnapshot,
    AwaitingFinalSnapshot,
    Sharing,
    CleaningUp,
    Succeeded,
    Failed,
    /// Failed, and ephemeral resources are still billing; needs an operator
    CleanupFailed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::Failed | RunState::CleanupFailed
        )
    }

    /// Next state after the work of `self` completed successfully
    ///
    /// `CleaningUp` is not covered: its successor depends on the run's
    /// original outcome (see [`RunState::after_cleanup`]).
    pub fn successor(self) -> RunState {
        match self {
            RunState::LocatingSnapshot => RunState::ProvisioningInstance,
            RunState::ProvisioningInstance => RunState::AwaitingInstanceReady,
            RunState::AwaitingInstanceReady => RunState::ResettingCredential,
            RunState::ResettingCredential => RunState::AwaitingCredentialApplied,
            RunState::AwaitingCredentialApplied => RunState::Sanitizing,
            RunState::Sanitizing => RunState::FinalizingSnapshot,
            RunState::FinalizingSnapshot => RunState::AwaitingFinalSnapshot,
            RunState::AwaitingFinalSnapshot => RunState::Sharing,
            RunState::Sharing => RunState::CleaningUp,
            RunState::CleaningUp
            | RunState::Succeeded
            | RunState::Failed
            | RunState::CleanupFailed => self,
        }
    }

    /// Next state after the work of `self` failed
    ///
    /// `LocatingSnapshot` goes straight to `Failed` unless it already
    /// requested an intermediate snapshot, which then needs deleting.
    pub fn on_failure(self, has_ephemeral_resources: bool) -> RunState {
        match self {
            RunState::LocatingSnapshot if !has_ephemeral_resources => RunState::Failed,
            RunState::CleaningUp => RunState::CleanupFailed,
            s if s.is_terminal() => s,
            _ => RunState::CleaningUp,
        }
    }

    /// Terminal state once cleanup has finished
    pub fn after_cleanup(run_failed: bool, cleanup_succeeded: bool) -> RunState {
        match (run_failed, cleanup_succeeded) {
            (_, false) => RunState::CleanupFailed,
            (true, true) => RunState::Failed,
            (false, true) => RunState::Succeeded,
        }
    }
}
