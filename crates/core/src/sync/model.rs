//! Sync domain enums shared by the triggers and the HTTP surface.

use serde::{Deserialize, Serialize};

/// Mutation kinds the propagator replays on the cloud store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        f.write_str(label)
    }
}

/// Which tables a reconciliation run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileScope {
    /// Every registered table, null-fill merge.
    #[default]
    All,
    /// The scheduled subset, local-newer-wins merge.
    #[serde(alias = "scheduled")]
    ScheduledSubset,
}

/// How rows present on both sides are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Fill nulls from the other side; never overwrite a value.
    NullFill,
    /// Push the whole local row when its recency marker is strictly newer.
    LocalNewerWins,
}

/// What started a reconciliation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncCycleTrigger {
    Startup,
    Periodic,
    Manual,
}
