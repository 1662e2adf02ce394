//! Repository for locally recorded deletes.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use edgesync_core::sync::{tombstone_key, Identifier};

use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::{Result, StorageError};
use crate::model::SyncTombstoneDB;
use crate::schema::sync_tombstones;

pub struct TombstoneRepository {
    pool: Arc<DbPool>,
    writer: WriteHandle,
}

impl TombstoneRepository {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self { pool, writer }
    }

    pub async fn record(&self, table: &str, identifier: &Identifier) -> Result<()> {
        let row = SyncTombstoneDB {
            table_name: table.to_string(),
            identifier_field: identifier.field.clone(),
            identifier_value: identifier.key(),
            deleted_at: Utc::now().to_rfc3339(),
        };
        self.writer
            .exec(move |conn| {
                diesel::replace_into(sync_tombstones::table)
                    .values(&row)
                    .execute(conn)?;
                Ok(())
            })
            .await
    }

    pub async fn clear(&self, table: &str, identifier: &Identifier) -> Result<()> {
        let table = table.to_string();
        let field = identifier.field.clone();
        let value = identifier.key();
        self.writer
            .exec(move |conn| {
                diesel::delete(
                    sync_tombstones::table
                        .filter(sync_tombstones::table_name.eq(table))
                        .filter(sync_tombstones::identifier_field.eq(field))
                        .filter(sync_tombstones::identifier_value.eq(value)),
                )
                .execute(conn)?;
                Ok(())
            })
            .await
    }

    /// Tombstone keys (`field:value`) for one table. Runs on the blocking pool.
    pub async fn keys_for_table(&self, table: &str) -> Result<HashSet<String>> {
        let pool = self.pool.clone();
        let table = table.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = get_connection(&pool)?;
            load_keys(&mut conn, &table)
        })
        .await
        .map_err(|err| StorageError::Task(err.to_string()))?
    }
}

fn load_keys(conn: &mut SqliteConnection, table: &str) -> Result<HashSet<String>> {
    let rows = sync_tombstones::table
        .filter(sync_tombstones::table_name.eq(table))
        .select(SyncTombstoneDB::as_select())
        .load::<SyncTombstoneDB>(conn)?;
    Ok(rows
        .into_iter()
        .map(|row| tombstone_key(&row.identifier_field, &row.identifier_value))
        .collect())
}
