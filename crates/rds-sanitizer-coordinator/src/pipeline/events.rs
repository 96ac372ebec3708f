//! Messages recorded in a run's transition history

use std::fmt;

use super::cleanup::CleanupReport;
use super::error::Failure;
use super::types::SnapshotMode;

pub(crate) enum RunEvent<'a> {
    Started {
        source_db: &'a str,
        mode: SnapshotMode,
    },
    StepCompleted,
    StepFailed(&'a Failure),
    CleanupFinished(&'a CleanupReport),
    CleanupFailed(&'a str),
    Resumed,
    /// The credential is held in memory only and is gone after a restart
    CredentialReissued,
}

impl fmt::Display for RunEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunEvent::Started { source_db, mode } => {
                write!(f, "run started for {source_db} ({mode})")
            }
            RunEvent::StepCompleted => f.write_str("step completed"),
            RunEvent::StepFailed(failure) => write!(f, "{}: {}", failure.kind, failure.message),
            RunEvent::CleanupFinished(report) => {
                write!(f, "cleanup removed {} resource(s)", report.removed.len())
            }
            RunEvent::CleanupFailed(detail) => write!(f, "cleanup failed: {detail}"),
            RunEvent::Resumed => f.write_str("run resumed"),
            RunEvent::CredentialReissued => {
                f.write_str("credential lost across restart, issuing a new one")
            }
        }
    }
}
