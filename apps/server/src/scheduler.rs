//! Background loop driving the scheduled reconciliation.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use edgesync_core::sync::{
    next_cycle_delay, ReconcileScope, SyncCycleTrigger, SyncService,
    SCHEDULED_SYNC_STARTUP_DELAY_SECS,
};

/// Aborts the loop when dropped.
pub struct SchedulerHandle {
    handle: JoinHandle<()>,
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn spawn_scheduled_sync(service: Arc<SyncService>, interval: Duration) -> SchedulerHandle {
    spawn_with_startup_delay(
        service,
        interval,
        Duration::from_secs(SCHEDULED_SYNC_STARTUP_DELAY_SECS),
    )
}

fn spawn_with_startup_delay(
    service: Arc<SyncService>,
    interval: Duration,
    startup_delay: Duration,
) -> SchedulerHandle {
    info!(
        "[ScheduledSync] Starting background loop (interval {}s)",
        interval.as_secs()
    );
    let handle = tokio::spawn(async move {
        tokio::time::sleep(startup_delay).await;
        run_cycle(&service, SyncCycleTrigger::Startup).await;
        loop {
            tokio::time::sleep(next_cycle_delay(interval)).await;
            run_cycle(&service, SyncCycleTrigger::Periodic).await;
        }
    });
    SchedulerHandle { handle }
}

/// One scheduled pass. Failures are logged; the loop never stops on them.
pub async fn run_cycle(service: &SyncService, trigger: SyncCycleTrigger) {
    match service
        .trigger_reconciliation(ReconcileScope::ScheduledSubset)
        .await
    {
        Ok(outcomes) => {
            let changes: usize = outcomes.values().map(|o| o.changes()).sum();
            let errors: usize = outcomes.values().map(|o| o.errors.len()).sum();
            info!(
                "[ScheduledSync] {:?} cycle finished: {} change(s), {} error(s)",
                trigger, changes, errors
            );
        }
        Err(err) => warn!("[ScheduledSync] {:?} cycle skipped: {}", trigger, err),
    }
}
