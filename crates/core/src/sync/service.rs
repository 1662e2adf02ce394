//! Entry points the rest of the application calls into.

use std::collections::BTreeMap;

use futures::future::join_all;
use log::{debug, info};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::errors::{Error, Result};
use crate::sync::context::SyncContext;
use crate::sync::model::{ReconcileScope, SyncOperation};
use crate::sync::outcome::{SyncOutcome, SyncResult, TableSyncStatus};
use crate::sync::propagator::DualWritePropagator;
use crate::sync::reconcile::ReconciliationEngine;
use crate::sync::record::Record;
use crate::sync::scheduled::ScheduledReconciler;

/// Propagation, reconciliation and status over one shared [`SyncContext`].
pub struct SyncService {
    ctx: SyncContext,
    propagator: DualWritePropagator,
    engine: ReconciliationEngine,
    scheduled: ScheduledReconciler,
    scheduled_guard: Mutex<()>,
}

impl SyncService {
    pub fn new(ctx: SyncContext) -> Self {
        let engine = ReconciliationEngine::new(ctx.clone());
        Self {
            propagator: DualWritePropagator::new(ctx.clone()),
            scheduled: ScheduledReconciler::new(engine.clone()),
            engine,
            ctx,
            scheduled_guard: Mutex::new(()),
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Fire-and-forget propagation of a committed local write.
    ///
    /// Returns as soon as the task is spawned. An unregistered table or an
    /// empty insert/update record is reported synchronously; the handle
    /// resolves to the logged outcome.
    pub fn on_mutation(
        &self,
        table: &str,
        operation: SyncOperation,
        record: Record,
    ) -> Result<JoinHandle<SyncResult>> {
        self.ctx.registry.get(table)?;
        if record.is_empty() && operation != SyncOperation::Delete {
            return Err(Error::InvalidRecord(format!("empty {} for {}", operation, table)));
        }
        let propagator = self.propagator.clone();
        let table = table.to_string();
        debug!("[DualWrite] Queued {} {}", operation, table);
        Ok(tokio::spawn(async move {
            propagator.propagate(&table, operation, &record, None).await
        }))
    }

    /// Runs a reconciliation pass and returns the per-table outcomes.
    ///
    /// A scheduled pass that would overlap a running one is refused with
    /// [`Error::ReconciliationInProgress`]. Full passes are not serialized.
    pub async fn trigger_reconciliation(
        &self,
        scope: ReconcileScope,
    ) -> Result<BTreeMap<String, SyncOutcome>> {
        match scope {
            ReconcileScope::All => {
                let tables = self.ctx.registry.full_sync_order();
                info!("[Reconcile] Full pass over {} tables", tables.len());
                Ok(self.engine.reconcile_all(&tables).await)
            }
            ReconcileScope::ScheduledSubset => {
                let _guard = self
                    .scheduled_guard
                    .try_lock()
                    .map_err(|_| Error::ReconciliationInProgress)?;
                Ok(self.scheduled.run_scheduled_sync().await)
            }
        }
    }

    /// Row counts of every registered table on both stores.
    pub async fn status(&self) -> Vec<TableSyncStatus> {
        let tables = self.ctx.registry.full_sync_order();
        join_all(tables.into_iter().map(|table| self.table_status(table))).await
    }

    async fn table_status(&self, table: &str) -> TableSyncStatus {
        let local = self.ctx.local.as_ref();
        let cloud = self.ctx.cloud.as_ref();
        let (local_count, cloud_count) = futures::join!(
            self.ctx.bounded(local, local.count(table)),
            self.ctx.bounded(cloud, cloud.count(table)),
        );

        let error = [local_count.as_ref().err(), cloud_count.as_ref().err()]
            .into_iter()
            .flatten()
            .map(Error::to_string)
            .collect::<Vec<_>>();
        let local_count = local_count.ok();
        let cloud_count = cloud_count.ok();

        TableSyncStatus {
            table: table.to_string(),
            in_sync: local_count.is_some() && local_count == cloud_count,
            local_count,
            cloud_count,
            error: (!error.is_empty()).then(|| error.join("; ")),
        }
    }
}
