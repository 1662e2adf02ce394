//! Timer-driven reconciliation of the high-churn tables.

use std::collections::BTreeMap;

use log::info;

use crate::sync::model::ConflictPolicy;
use crate::sync::outcome::SyncOutcome;
use crate::sync::reconcile::ReconciliationEngine;

/// Last-write-wins pass over the scheduled subset, biased towards the local store.
#[derive(Clone)]
pub struct ScheduledReconciler {
    engine: ReconciliationEngine,
}

impl ScheduledReconciler {
    pub fn new(engine: ReconciliationEngine) -> Self {
        Self { engine }
    }

    /// One pass over the scheduled tables.
    ///
    /// Rows on both sides are pushed to the cloud only when the local recency
    /// marker is strictly newer. Callers may ignore the report.
    pub async fn run_scheduled_sync(&self) -> BTreeMap<String, SyncOutcome> {
        let tables = self.engine.context().registry.scheduled_tables();
        info!("[ScheduledSync] Starting pass over {:?}", tables);
        let results = self
            .engine
            .reconcile_tables(&tables, ConflictPolicy::LocalNewerWins)
            .await;
        let changes: usize = results.values().map(SyncOutcome::changes).sum();
        let errors: usize = results.values().map(|outcome| outcome.errors.len()).sum();
        info!(
            "[ScheduledSync] Pass complete: {} changes, {} errors",
            changes, errors
        );
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::context::{SyncContext, SyncSettings};
    use crate::sync::registry::TableRegistry;
    use crate::sync::testing::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    const USER_COLUMNS: &[&str] = &["uuid", "email", "name", "updated_at", "last_online"];
    const PRODUCT_COLUMNS: &[&str] = &["id", "user_uuid", "metadata", "updated_at"];
    const SITE_COLUMNS: &[&str] = &["id", "slug", "name", "updated_at"];

    fn setup() -> (Arc<MemoryStore>, Arc<MemoryStore>, ScheduledReconciler) {
        let local = Arc::new(
            MemoryStore::local()
                .with_table("users", USER_COLUMNS, &["uuid", "email"])
                .with_table("user_products", PRODUCT_COLUMNS, &["id"])
                .with_table("sites", SITE_COLUMNS, &["id", "slug"]),
        );
        let cloud = Arc::new(
            MemoryStore::cloud()
                .with_table("users", USER_COLUMNS, &["uuid", "email"])
                .with_table("user_products", PRODUCT_COLUMNS, &["id"])
                .with_table("sites", SITE_COLUMNS, &["id", "slug"]),
        );
        let ctx = SyncContext::new(
            local.clone(),
            cloud.clone(),
            Arc::new(TableRegistry::default()),
            SyncSettings::default(),
        );
        (local, cloud, ScheduledReconciler::new(ReconciliationEngine::new(ctx)))
    }

    #[tokio::test]
    async fn newer_local_row_overwrites_cloud() {
        let (local, cloud, reconciler) = setup();
        local.seed(
            "sites",
            vec![json!({ "id": "s1", "slug": "bakery", "name": "New", "updated_at": "2024-02-01T00:00:00Z" })],
        );
        cloud.seed(
            "sites",
            vec![json!({ "id": "s1", "slug": "bakery", "name": "Old", "updated_at": "2024-01-01T00:00:00Z" })],
        );

        let results = reconciler.run_scheduled_sync().await;

        assert_eq!(results["sites"].cloud_updated, 1);
        let row = cloud.find("sites", "id", "s1").expect("cloud row");
        assert_eq!(row["name"], json!("New"));
        assert_eq!(row["updated_at"], json!("2024-02-01T00:00:00Z"));
    }

    #[tokio::test]
    async fn older_local_row_changes_nothing() {
        let (local, cloud, reconciler) = setup();
        local.seed(
            "sites",
            vec![json!({ "id": "s1", "name": "Stale", "updated_at": "2024-01-01T00:00:00Z" })],
        );
        cloud.seed(
            "sites",
            vec![json!({ "id": "s1", "name": "Fresh", "updated_at": "2024-02-01T00:00:00Z" })],
        );

        let results = reconciler.run_scheduled_sync().await;

        assert_eq!(results["sites"].changes(), 0);
        assert_eq!(cloud.find("sites", "id", "s1").expect("row")["name"], json!("Fresh"));
        assert_eq!(local.find("sites", "id", "s1").expect("row")["name"], json!("Stale"));
    }

    #[tokio::test]
    async fn users_fall_back_to_last_online() {
        let (local, cloud, reconciler) = setup();
        local.seed(
            "users",
            vec![json!({ "uuid": "u1", "email": "a@x.com", "name": "A", "last_online": "2024-03-01 10:00:00" })],
        );
        cloud.seed(
            "users",
            vec![json!({ "uuid": "u1", "email": "a@x.com", "name": "B", "last_online": "2024-03-01T09:00:00Z" })],
        );

        reconciler.run_scheduled_sync().await;

        let row = cloud.find("users", "uuid", "u1").expect("row");
        assert_eq!(row["name"], json!("A"));
        assert_eq!(row["email"], json!("a@x.com"));
    }

    #[tokio::test]
    async fn recency_fields_are_not_mixed_across_rows() {
        let (local, cloud, reconciler) = setup();
        local.seed(
            "users",
            vec![json!({ "uuid": "u1", "email": "a@x.com", "name": "Local", "last_online": "2026-06-01T00:00:00Z" })],
        );
        cloud.seed(
            "users",
            vec![json!({ "uuid": "u1", "email": "a@x.com", "name": "Cloud", "updated_at": "2024-01-01T00:00:00Z" })],
        );

        let results = reconciler.run_scheduled_sync().await;

        assert_eq!(results["users"].cloud_updated, 0);
        assert_eq!(cloud.find("users", "uuid", "u1").expect("row")["name"], json!("Cloud"));
    }

    #[tokio::test]
    async fn one_sided_rows_are_inserted_and_repeat_runs_are_quiet() {
        let (local, cloud, reconciler) = setup();
        local.seed(
            "user_products",
            vec![json!({ "id": "p1", "user_uuid": "u1", "metadata": "{\"seats\":2}", "updated_at": "2024-01-01T00:00:00Z" })],
        );
        cloud.seed("users", vec![json!({ "uuid": "u9", "email": "z@x.com" })]);

        let first = reconciler.run_scheduled_sync().await;
        assert_eq!(first["user_products"].local_to_cloud_inserted, 1);
        assert_eq!(first["users"].cloud_to_local_inserted, 1);
        assert_eq!(
            cloud.find("user_products", "id", "p1").expect("row")["metadata"],
            json!({ "seats": 2 })
        );

        let second = reconciler.run_scheduled_sync().await;
        assert!(second.values().all(|outcome| outcome.changes() == 0));
    }

    #[tokio::test]
    async fn only_the_scheduled_subset_is_visited() {
        let (_, _, reconciler) = setup();
        let results = reconciler.run_scheduled_sync().await;
        let tables: Vec<&str> = results.keys().map(String::as_str).collect();
        assert_eq!(tables, vec!["sites", "user_products", "users"]);
    }
}
