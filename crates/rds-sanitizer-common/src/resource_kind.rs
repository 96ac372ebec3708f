//! Ephemeral resource kinds and cleanup ordering
//!
//! A run creates at most two kinds of resources: the restored database
//! instance and the intermediate snapshot it was restored from. The final
//! sanitized snapshot is an output, never an ephemeral resource.

/// Types of AWS resources a run creates and must remove
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Ephemeral database instance restored from a snapshot
    DbInstance,
    /// Intermediate snapshot taken from the source database
    DbSnapshot,
}

impl ResourceKind {
    /// Get cleanup priority (lower number = cleanup first)
    ///
    /// The instance goes first: an instance that is still being restored
    /// keeps its source snapshot busy, and deleting the snapshot early just
    /// fails with an invalid-state error.
    pub fn cleanup_priority(self) -> u8 {
        match self {
            ResourceKind::DbInstance => 0,
            ResourceKind::DbSnapshot => 1,
        }
    }

    /// Stable string stored in the state database
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::DbInstance => "db-instance",
            ResourceKind::DbSnapshot => "db-snapshot",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "db-instance" => Some(ResourceKind::DbInstance),
            "db-snapshot" => Some(ResourceKind::DbSnapshot),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
