//! Best-effort replay of one local mutation onto the cloud store.

use log::{debug, warn};

use crate::errors::{Error, Result, StoreError};
use crate::sync::context::SyncContext;
use crate::sync::model::SyncOperation;
use crate::sync::outcome::SyncResult;
use crate::sync::record::{normalize_for_propagation, Record};
use crate::sync::registry::{identifier_for_field, resolve_identifier, Identifier, TableDescriptor};

/// Pushes single-row mutations from the local store to the cloud store.
#[derive(Clone)]
pub struct DualWritePropagator {
    ctx: SyncContext,
}

impl DualWritePropagator {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    /// Replays `operation` on the cloud store.
    ///
    /// Never fails: every outcome, including an unknown table, is reported in
    /// the returned [`SyncResult`] and logged.
    pub async fn propagate(
        &self,
        table: &str,
        operation: SyncOperation,
        record: &Record,
        identifier: Option<Identifier>,
    ) -> SyncResult {
        match self.try_propagate(table, operation, record, identifier).await {
            Ok(()) => {
                debug!("[DualWrite] {} {} propagated", operation, table);
                SyncResult::ok()
            }
            Err(err) => {
                warn!("[DualWrite] {} {} failed: {}", operation, table, err);
                SyncResult::failed(err.to_string())
            }
        }
    }

    async fn try_propagate(
        &self,
        table: &str,
        operation: SyncOperation,
        record: &Record,
        identifier: Option<Identifier>,
    ) -> Result<()> {
        let descriptor = self.ctx.registry.get(table)?;
        let identifier = identifier.or_else(|| resolve_identifier(descriptor, record));

        match operation {
            SyncOperation::Insert => self.insert(descriptor, record, identifier).await,
            SyncOperation::Update => {
                let identifier = identifier.ok_or_else(|| Error::MissingIdentifier {
                    table: table.to_string(),
                })?;
                let patch = self.update_patch(descriptor, record, &identifier);
                if patch.is_empty() {
                    return Ok(());
                }
                if self.update(descriptor, &identifier, &patch).await? == 0 {
                    debug!("[DualWrite] No cloud row in {} matched {}", table, identifier);
                }
                Ok(())
            }
            SyncOperation::Delete => {
                let identifier = identifier.ok_or_else(|| Error::MissingIdentifier {
                    table: table.to_string(),
                })?;
                self.delete(descriptor, &identifier).await
            }
        }
    }

    async fn insert(
        &self,
        descriptor: &TableDescriptor,
        record: &Record,
        identifier: Option<Identifier>,
    ) -> Result<()> {
        let cloud = self.ctx.cloud.as_ref();
        let payload = normalize_for_propagation(descriptor, record, cloud.json_encoding());
        let label = format!("insert {}", descriptor.name);

        match self
            .ctx
            .retried(cloud, &label, || cloud.insert(descriptor.name, &payload))
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_unique_violation() => {
                let existing = identifier.as_ref().ok_or_else(|| Error::MissingIdentifier {
                    table: descriptor.name.to_string(),
                })?;
                self.update_existing(descriptor, record, existing, err).await?;
            }
            Err(err) => return Err(Error::store(cloud.name(), err)),
        }

        if let Some(identifier) = identifier {
            let local = self.ctx.local.as_ref();
            if let Err(err) = self
                .ctx
                .bounded(local, local.clear_tombstone(descriptor.name, &identifier))
                .await
            {
                warn!("[DualWrite] Could not clear tombstone for {}: {}", identifier, err);
            }
        }
        Ok(())
    }

    /// Falls back from a colliding insert to an update. Tries the resolved
    /// identifier first, then every other key the record carries, until one
    /// of them matches a cloud row.
    async fn update_existing(
        &self,
        descriptor: &TableDescriptor,
        record: &Record,
        resolved: &Identifier,
        collision: StoreError,
    ) -> Result<()> {
        let candidates = std::iter::once(resolved.clone()).chain(
            descriptor
                .identifier_fields()
                .filter(|field| *field != resolved.field)
                .filter_map(|field| identifier_for_field(record, field)),
        );

        for candidate in candidates {
            let patch = self.update_patch(descriptor, record, &candidate);
            if patch.is_empty() {
                // Only key columns: the colliding row already holds them.
                return Ok(());
            }
            debug!(
                "[DualWrite] Row already exists in cloud {}, updating by {}",
                descriptor.name, candidate
            );
            if self.update(descriptor, &candidate, &patch).await? > 0 {
                return Ok(());
            }
        }

        warn!(
            "[DualWrite] Insert into {} collided but no cloud row matched any key",
            descriptor.name
        );
        Err(Error::store(self.ctx.cloud.name(), collision))
    }

    fn update_patch(
        &self,
        descriptor: &TableDescriptor,
        record: &Record,
        identifier: &Identifier,
    ) -> Record {
        let encoding = self.ctx.cloud.json_encoding();
        let mut patch = normalize_for_propagation(descriptor, record, encoding);
        patch.remove(&identifier.field);
        if identifier.field != descriptor.primary_key {
            // Matched by a fallback key: the cloud row keeps its own primary key.
            patch.remove(descriptor.primary_key);
        }
        patch
    }

    /// Returns the number of cloud rows the update matched.
    async fn update(
        &self,
        descriptor: &TableDescriptor,
        identifier: &Identifier,
        patch: &Record,
    ) -> Result<u64> {
        let cloud = self.ctx.cloud.as_ref();
        let label = format!("update {}", descriptor.name);
        self.ctx
            .retried(cloud, &label, || cloud.update(descriptor.name, identifier, patch))
            .await
            .map_err(|err| Error::store(cloud.name(), err))
    }

    async fn delete(&self, descriptor: &TableDescriptor, identifier: &Identifier) -> Result<()> {
        // Tombstone first so a failed cloud delete is finished by reconciliation.
        let local = self.ctx.local.as_ref();
        if let Err(err) = self
            .ctx
            .bounded(local, local.record_tombstone(descriptor.name, identifier))
            .await
        {
            warn!("[DualWrite] Could not record tombstone for {}: {}", identifier, err);
        }

        let cloud = self.ctx.cloud.as_ref();
        let label = format!("delete {}", descriptor.name);
        self.ctx
            .retried(cloud, &label, || cloud.delete(descriptor.name, identifier))
            .await
            .map_err(|err| Error::store(cloud.name(), err))
    }
}
