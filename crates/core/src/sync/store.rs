//! Contract every store (local SQLite, cloud PostgREST) implements.

use std::collections::HashSet;

use async_trait::async_trait;

use crate::errors::StoreResult;
use crate::sync::record::{JsonEncoding, Record};
use crate::sync::registry::Identifier;

/// Row-level access to one store.
///
/// Column names passed to writes come from the registry allow-list or from
/// [`StoreAdapter::columns`]; adapters must still quote them and bind every
/// value as a parameter.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Short label used in logs and error messages (`"local"`, `"cloud"`).
    fn name(&self) -> &'static str;

    /// Representation this store expects for JSON-typed columns.
    fn json_encoding(&self) -> JsonEncoding;

    /// Full snapshot of a table.
    async fn select(&self, table: &str) -> StoreResult<Vec<Record>>;

    /// Creates a row. Key collisions surface as `StoreError::UniqueViolation`.
    async fn insert(&self, table: &str, record: &Record) -> StoreResult<()>;

    /// Partial update of the row matched by `identifier`. Returns the number of
    /// rows matched; zero means nothing carries that identifier.
    async fn update(&self, table: &str, identifier: &Identifier, patch: &Record) -> StoreResult<u64>;

    async fn delete(&self, table: &str, identifier: &Identifier) -> StoreResult<()>;

    /// Column names the store's schema reports for the table.
    async fn columns(&self, table: &str) -> StoreResult<HashSet<String>>;

    async fn count(&self, table: &str) -> StoreResult<u64>;

    /// Remembers that a row was deleted so reconciliation does not bring it back.
    async fn record_tombstone(&self, _table: &str, _identifier: &Identifier) -> StoreResult<()> {
        Ok(())
    }

    async fn clear_tombstone(&self, _table: &str, _identifier: &Identifier) -> StoreResult<()> {
        Ok(())
    }

    /// Tombstone keys (`field:value`) recorded for the table.
    async fn tombstones(&self, _table: &str) -> StoreResult<HashSet<String>> {
        Ok(HashSet::new())
    }
}
