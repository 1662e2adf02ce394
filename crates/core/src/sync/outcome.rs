//! Report types returned by propagation and reconciliation.

use serde::{Deserialize, Serialize};

/// Per-table counters for one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub local_count: usize,
    pub cloud_count: usize,
    pub local_to_cloud_inserted: usize,
    pub cloud_to_local_inserted: usize,
    pub local_updated: usize,
    pub cloud_updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl SyncOutcome {
    /// Rows written on either side.
    pub fn changes(&self) -> usize {
        self.local_to_cloud_inserted
            + self.cloud_to_local_inserted
            + self.local_updated
            + self.cloud_updated
            + self.deleted
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub(crate) fn push_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("[Reconcile] {}", message);
        self.errors.push(message);
    }
}

/// Result of propagating one mutation. Logged, never surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub error: Option<String>,
}

impl SyncResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Row-count comparison for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSyncStatus {
    pub table: String,
    pub local_count: Option<u64>,
    pub cloud_count: Option<u64>,
    pub in_sync: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_serializes_camel_case() {
        let outcome = SyncOutcome {
            local_to_cloud_inserted: 2,
            cloud_updated: 1,
            ..SyncOutcome::default()
        };
        let value = serde_json::to_value(&outcome).expect("serialize outcome");
        assert_eq!(value["localToCloudInserted"], 2);
        assert_eq!(value["cloudUpdated"], 1);
        assert_eq!(outcome.changes(), 3);
    }

    #[test]
    fn status_omits_missing_error() {
        let status = TableSyncStatus {
            table: "users".into(),
            local_count: Some(3),
            cloud_count: Some(3),
            in_sync: true,
            error: None,
        };
        let value = serde_json::to_value(&status).expect("serialize status");
        assert!(value.get("error").is_none());
        assert_eq!(value["inSync"], true);
    }
}
