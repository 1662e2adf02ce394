//! Database models for sync bookkeeping tables.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Queryable, Identifiable, Insertable, Selectable, Debug, Clone, PartialEq, Serialize, Deserialize,
)]
#[diesel(primary_key(table_name, identifier_field, identifier_value))]
#[diesel(table_name = crate::schema::sync_tombstones)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncTombstoneDB {
    pub table_name: String,
    pub identifier_field: String,
    pub identifier_value: String,
    pub deleted_at: String,
}
