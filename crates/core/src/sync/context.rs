//! Shared handles passed to every sync trigger.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{Error, Result, StoreError, StoreResult};
use crate::sync::record::Record;
use crate::sync::registry::TableRegistry;
use crate::sync::retry::{with_retry, RetryPolicy};
use crate::sync::store::StoreAdapter;

/// Default bound on one store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on reconciling one table.
pub const DEFAULT_TABLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub store_timeout: Duration,
    pub table_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            store_timeout: DEFAULT_STORE_TIMEOUT,
            table_timeout: DEFAULT_TABLE_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Both stores and the registry, built once at startup.
#[derive(Clone)]
pub struct SyncContext {
    pub local: Arc<dyn StoreAdapter>,
    pub cloud: Arc<dyn StoreAdapter>,
    pub registry: Arc<TableRegistry>,
    pub settings: SyncSettings,
}

impl SyncContext {
    pub fn new(
        local: Arc<dyn StoreAdapter>,
        cloud: Arc<dyn StoreAdapter>,
        registry: Arc<TableRegistry>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            local,
            cloud,
            registry,
            settings,
        }
    }

    /// One store call under the configured timeout, without retries.
    pub(crate) async fn bounded<T, Fut>(&self, store: &dyn StoreAdapter, call: Fut) -> Result<T>
    where
        Fut: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.settings.store_timeout, call).await {
            Ok(result) => result.map_err(|err| Error::store(store.name(), err)),
            Err(_) => Err(Error::store(
                store.name(),
                StoreError::Timeout(self.settings.store_timeout),
            )),
        }
    }

    /// Full-table read. Adapters that page bound each page themselves, so only
    /// the per-table timeout covers the whole snapshot.
    pub(crate) async fn snapshot(
        &self,
        store: &dyn StoreAdapter,
        table: &str,
    ) -> Result<Vec<Record>> {
        store
            .select(table)
            .await
            .map_err(|err| Error::store(store.name(), err))
    }

    /// One store call under the configured timeout and retry policy.
    pub(crate) async fn retried<T, F, Fut>(
        &self,
        store: &dyn StoreAdapter,
        label: &str,
        call: F,
    ) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let label = format!("{} {}", store.name(), label);
        with_retry(&self.settings.retry, self.settings.store_timeout, &label, call).await
    }
}
