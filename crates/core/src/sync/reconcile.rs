//! Snapshot-diff reconciliation between the local and cloud stores.
//!
//! Each table is read in full from both stores, rows are matched by primary
//! key then by fallback keys, one-sided rows are inserted on the other side,
//! and rows present on both sides are merged according to a [`ConflictPolicy`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Instant;

use log::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::sync::context::SyncContext;
use crate::sync::lww::local_is_newer;
use crate::sync::model::ConflictPolicy;
use crate::sync::outcome::SyncOutcome;
use crate::sync::record::{
    null_fill_patch, overwrite_patch, prepare_insert, recency_pair, value_key, Record,
};
use crate::sync::registry::{identifier_for_field, resolve_identifier, TableDescriptor};
use crate::sync::store::StoreAdapter;

/// Rows of one snapshot keyed by every identifier field they carry.
struct RowIndex<'a> {
    by_field: HashMap<&'static str, HashMap<String, &'a Record>>,
}

impl<'a> RowIndex<'a> {
    fn build(descriptor: &TableDescriptor, rows: &'a [Record]) -> Self {
        let mut by_field: HashMap<&'static str, HashMap<String, &'a Record>> = HashMap::new();
        for field in descriptor.identifier_fields() {
            let keyed = by_field.entry(field).or_default();
            for row in rows {
                if let Some(key) = row.get(field).and_then(value_key) {
                    keyed.entry(key).or_insert(row);
                }
            }
        }
        Self { by_field }
    }

    /// The row on this side that is the same entity as `row`.
    fn find(&self, descriptor: &TableDescriptor, row: &Record) -> Option<&'a Record> {
        descriptor.identifier_fields().find_map(|field| {
            let key = row.get(field).and_then(value_key)?;
            self.by_field.get(field)?.get(&key).copied()
        })
    }
}

/// Which way a write goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    CloudToLocal,
    LocalToCloud,
}

/// Columns of both schemas plus the local tombstones for one table.
struct TableSchemas {
    local_columns: HashSet<String>,
    cloud_columns: HashSet<String>,
    tombstones: HashSet<String>,
}

fn log_prefix(policy: ConflictPolicy) -> &'static str {
    match policy {
        ConflictPolicy::NullFill => "[Reconcile]",
        ConflictPolicy::LocalNewerWins => "[ScheduledSync]",
    }
}

/// Runs reconciliation passes over registered tables.
#[derive(Clone)]
pub struct ReconciliationEngine {
    ctx: SyncContext,
}

impl ReconciliationEngine {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Null-fill reconciliation of `tables`, in the given order.
    pub async fn reconcile_all(&self, tables: &[&str]) -> BTreeMap<String, SyncOutcome> {
        self.reconcile_tables(tables, ConflictPolicy::NullFill).await
    }

    /// Reconciles each table under `policy`.
    ///
    /// A failing table is recorded in its outcome and the run moves on.
    pub async fn reconcile_tables(
        &self,
        tables: &[&str],
        policy: ConflictPolicy,
    ) -> BTreeMap<String, SyncOutcome> {
        let prefix = log_prefix(policy);
        let mut results = BTreeMap::new();

        for table in tables {
            let started = Instant::now();
            let mut outcome = SyncOutcome::default();

            match self.ctx.registry.get(table) {
                Err(err) => outcome.push_error(err.to_string()),
                Ok(descriptor) => {
                    let table_timeout = self.ctx.settings.table_timeout;
                    let result = tokio::time::timeout(
                        table_timeout,
                        self.reconcile_table(descriptor, policy, &mut outcome),
                    )
                    .await;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => outcome.push_error(format!("{}: {}", table, err)),
                        Err(_) => outcome
                            .push_error(format!("{}: timed out after {:?}", table, table_timeout)),
                    }
                }
            }

            outcome.duration_ms = started.elapsed().as_millis() as u64;
            info!(
                "{} {}: {} local / {} cloud rows, inserted {} local {} cloud, updated {} local {} cloud, deleted {}, skipped {}, {} errors in {}ms",
                prefix,
                table,
                outcome.local_count,
                outcome.cloud_count,
                outcome.cloud_to_local_inserted,
                outcome.local_to_cloud_inserted,
                outcome.local_updated,
                outcome.cloud_updated,
                outcome.deleted,
                outcome.skipped,
                outcome.errors.len(),
                outcome.duration_ms
            );
            results.insert(table.to_string(), outcome);
        }

        results
    }

    async fn load_schemas(&self, descriptor: &TableDescriptor) -> Result<TableSchemas> {
        let local = self.ctx.local.as_ref();
        let cloud = self.ctx.cloud.as_ref();
        let name = descriptor.name;

        Ok(TableSchemas {
            local_columns: self.ctx.bounded(local, local.columns(name)).await?,
            cloud_columns: self.ctx.bounded(cloud, cloud.columns(name)).await?,
            tombstones: self.ctx.bounded(local, local.tombstones(name)).await?,
        })
    }

    async fn reconcile_table(
        &self,
        descriptor: &TableDescriptor,
        policy: ConflictPolicy,
        outcome: &mut SyncOutcome,
    ) -> Result<()> {
        let local = self.ctx.local.as_ref();
        let cloud = self.ctx.cloud.as_ref();
        let name = descriptor.name;

        let local_rows = self.ctx.snapshot(local, name).await?;
        let cloud_rows = self.ctx.snapshot(cloud, name).await?;
        outcome.local_count = local_rows.len();
        outcome.cloud_count = cloud_rows.len();
        let schemas = self.load_schemas(descriptor).await?;

        let local_index = RowIndex::build(descriptor, &local_rows);
        let cloud_index = RowIndex::build(descriptor, &cloud_rows);

        for cloud_row in &cloud_rows {
            match local_index.find(descriptor, cloud_row) {
                Some(local_row) => {
                    if policy == ConflictPolicy::NullFill {
                        let direction = Direction::CloudToLocal;
                        self.fill_nulls(descriptor, cloud_row, local_row, direction, &schemas, outcome)
                            .await;
                    }
                }
                None => {
                    if self
                        .delete_if_tombstoned(descriptor, cloud_row, &schemas, outcome)
                        .await
                    {
                        continue;
                    }
                    let direction = Direction::CloudToLocal;
                    self.insert_missing(descriptor, cloud_row, direction, &schemas, outcome)
                        .await;
                }
            }
        }

        for local_row in &local_rows {
            match cloud_index.find(descriptor, local_row) {
                Some(cloud_row) => match policy {
                    ConflictPolicy::NullFill => {
                        let direction = Direction::LocalToCloud;
                        self.fill_nulls(descriptor, local_row, cloud_row, direction, &schemas, outcome)
                            .await
                    }
                    ConflictPolicy::LocalNewerWins => {
                        self.push_if_newer(descriptor, local_row, cloud_row, &schemas, outcome)
                            .await
                    }
                },
                None => {
                    let direction = Direction::LocalToCloud;
                    self.insert_missing(descriptor, local_row, direction, &schemas, outcome)
                        .await
                }
            }
        }

        Ok(())
    }

    fn target(&self, direction: Direction) -> &dyn StoreAdapter {
        match direction {
            Direction::CloudToLocal => self.ctx.local.as_ref(),
            Direction::LocalToCloud => self.ctx.cloud.as_ref(),
        }
    }

    async fn insert_missing(
        &self,
        descriptor: &TableDescriptor,
        row: &Record,
        direction: Direction,
        schemas: &TableSchemas,
        outcome: &mut SyncOutcome,
    ) {
        let Some(identifier) = resolve_identifier(descriptor, row) else {
            outcome.skipped += 1;
            outcome.push_error(format!("{}: row without identifier skipped", descriptor.name));
            return;
        };

        let target = self.target(direction);
        let columns = match direction {
            Direction::CloudToLocal => &schemas.local_columns,
            Direction::LocalToCloud => &schemas.cloud_columns,
        };
        let payload = match prepare_insert(descriptor, row, columns, target.json_encoding()) {
            Ok(payload) => payload,
            Err(err) => {
                outcome.skipped += 1;
                let name = descriptor.name;
                outcome.push_error(format!("{}: {} skipped: {}", name, identifier, err));
                return;
            }
        };

        match self.ctx.bounded(target, target.insert(descriptor.name, &payload)).await {
            Ok(()) => match direction {
                Direction::CloudToLocal => outcome.cloud_to_local_inserted += 1,
                Direction::LocalToCloud => outcome.local_to_cloud_inserted += 1,
            },
            Err(Error::Store { source, .. }) if source.is_unique_violation() => {
                warn!(
                    "[Reconcile] {} {} collides with an existing {} row, skipped",
                    descriptor.name,
                    identifier,
                    target.name()
                );
                outcome.skipped += 1;
            }
            Err(err) => outcome.push_error(format!(
                "{}: insert {} into {} failed: {}",
                descriptor.name,
                identifier,
                target.name(),
                err
            )),
        }
    }

    async fn fill_nulls(
        &self,
        descriptor: &TableDescriptor,
        source: &Record,
        existing: &Record,
        direction: Direction,
        schemas: &TableSchemas,
        outcome: &mut SyncOutcome,
    ) {
        let target = self.target(direction);
        let columns = match direction {
            Direction::CloudToLocal => &schemas.local_columns,
            Direction::LocalToCloud => &schemas.cloud_columns,
        };
        let patch = null_fill_patch(descriptor, source, existing, columns, target.json_encoding());
        if patch.is_empty() {
            return;
        }

        let Some(identifier) = resolve_identifier(descriptor, existing) else {
            outcome.skipped += 1;
            return;
        };
        debug!(
            "[Reconcile] Filling {:?} on {} {}",
            patch.keys().collect::<Vec<_>>(),
            target.name(),
            identifier
        );

        match self
            .ctx
            .bounded(target, target.update(descriptor.name, &identifier, &patch))
            .await
        {
            Ok(0) => outcome.skipped += 1,
            Ok(_) => match direction {
                Direction::CloudToLocal => outcome.local_updated += 1,
                Direction::LocalToCloud => outcome.cloud_updated += 1,
            },
            Err(err) => outcome.push_error(format!(
                "{}: fill {} on {} failed: {}",
                descriptor.name,
                identifier,
                target.name(),
                err
            )),
        }
    }

    async fn push_if_newer(
        &self,
        descriptor: &TableDescriptor,
        local_row: &Record,
        cloud_row: &Record,
        schemas: &TableSchemas,
        outcome: &mut SyncOutcome,
    ) {
        let (local_recency, cloud_recency) = recency_pair(descriptor, local_row, cloud_row);
        if !local_is_newer(local_recency, cloud_recency) {
            return;
        }

        let Some(identifier) = resolve_identifier(descriptor, cloud_row) else {
            outcome.skipped += 1;
            return;
        };
        let cloud = self.ctx.cloud.as_ref();
        let patch = overwrite_patch(
            descriptor,
            local_row,
            &schemas.cloud_columns,
            cloud.json_encoding(),
        );
        if patch.is_empty() {
            return;
        }
        debug!(
            "[ScheduledSync] Local {} {} is newer ({:?} > {:?})",
            descriptor.name, identifier, local_recency, cloud_recency
        );

        match self
            .ctx
            .bounded(cloud, cloud.update(descriptor.name, &identifier, &patch))
            .await
        {
            Ok(0) => outcome.skipped += 1,
            Ok(_) => outcome.cloud_updated += 1,
            Err(err) => outcome.push_error(format!(
                "{}: push {} to cloud failed: {}",
                descriptor.name, identifier, err
            )),
        }
    }

    /// Deletes a cloud-only row whose identifier was deleted locally.
    async fn delete_if_tombstoned(
        &self,
        descriptor: &TableDescriptor,
        cloud_row: &Record,
        schemas: &TableSchemas,
        outcome: &mut SyncOutcome,
    ) -> bool {
        if schemas.tombstones.is_empty() {
            return false;
        }
        let Some(identifier) = descriptor
            .identifier_fields()
            .filter_map(|field| identifier_for_field(cloud_row, field))
            .find(|identifier| schemas.tombstones.contains(&identifier.tombstone_key()))
        else {
            return false;
        };

        let cloud = self.ctx.cloud.as_ref();
        match self.ctx.bounded(cloud, cloud.delete(descriptor.name, &identifier)).await {
            Ok(()) => outcome.deleted += 1,
            Err(err) => outcome.push_error(format!(
                "{}: delete tombstoned {} from cloud failed: {}",
                descriptor.name, identifier, err
            )),
        }
        true
    }
}
