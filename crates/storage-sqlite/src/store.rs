//! Local store adapter over the pooled SQLite database.
//!
//! Rows are read generically through `json_object(...)` so the adapter works
//! for any registered table without per-table diesel models. Column names are
//! taken from `PRAGMA table_xinfo` and quoted; every value is a bound parameter.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::query_builder::{BoxedSqlQuery, SqlQuery};
use diesel::sql_types::{BigInt, Double, Integer, Nullable, Text};
use diesel::sqlite::{Sqlite, SqliteConnection};
use serde_json::Value;

use edgesync_core::sync::{Identifier, JsonEncoding, Record, StoreAdapter};
use edgesync_core::StoreResult;

use crate::db::{get_connection, DbPool, WriteHandle};
use crate::errors::{Result, StorageError};
use crate::tombstones::TombstoneRepository;

/// Arguments per `json_object` call; SQLite caps function arguments at 127.
const JSON_OBJECT_COLUMNS_PER_CALL: usize = 50;

type BoundQuery = BoxedSqlQuery<'static, Sqlite, SqlQuery>;

fn escape_sqlite_str(value: &str) -> String {
    value.replace('\'', "''")
}

fn quote_identifier(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

#[derive(diesel::QueryableByName)]
struct PragmaTableInfoRow {
    #[diesel(sql_type = Text)]
    name: String,
}

#[derive(diesel::QueryableByName)]
struct PragmaTableXInfoRow {
    #[diesel(sql_type = Text)]
    name: String,
    #[diesel(sql_type = Integer)]
    hidden: i32,
}

#[derive(diesel::QueryableByName)]
struct JsonRow {
    #[diesel(sql_type = Text)]
    payload: String,
}

#[derive(diesel::QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

fn load_table_columns(conn: &mut SqliteConnection, table_name: &str) -> Result<Vec<String>> {
    let pragma_xinfo_sql = format!("PRAGMA table_xinfo('{}')", escape_sqlite_str(table_name));
    let xinfo_result = diesel::sql_query(pragma_xinfo_sql)
        .load::<PragmaTableXInfoRow>(conn)
        .map_err(StorageError::from);
    let columns = match xinfo_result {
        Ok(rows) => rows
            .into_iter()
            .filter(|row| row.hidden == 0)
            .map(|row| row.name)
            .collect::<Vec<_>>(),
        Err(_) => {
            let pragma_info_sql =
                format!("PRAGMA table_info('{}')", escape_sqlite_str(table_name));
            diesel::sql_query(pragma_info_sql)
                .load::<PragmaTableInfoRow>(conn)
                .map_err(StorageError::from)?
                .into_iter()
                .map(|row| row.name)
                .collect::<Vec<_>>()
        }
    };

    if columns.is_empty() {
        return Err(StorageError::UnknownTable(table_name.to_string()));
    }
    Ok(columns)
}

/// `SELECT json_array(json_object(...), ...)` over every column, chunked under the argument cap.
fn select_rows_sql(table_name: &str, columns: &[String]) -> String {
    let objects = columns
        .chunks(JSON_OBJECT_COLUMNS_PER_CALL)
        .map(|chunk| {
            let pairs = chunk
                .iter()
                .map(|column| {
                    format!("'{}', {}", escape_sqlite_str(column), quote_identifier(column))
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("json_object({})", pairs)
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT json_array({}) AS payload FROM {}",
        objects,
        quote_identifier(table_name)
    )
}

fn merge_row_chunks(payload: &str) -> Result<Record> {
    let chunks: Vec<Record> = serde_json::from_str(payload)?;
    let mut record = Record::new();
    for chunk in chunks {
        record.extend(chunk);
    }
    Ok(record)
}

fn bind_value(query: BoundQuery, value: &Value) -> BoundQuery {
    match value {
        Value::Null => query.bind::<Nullable<Text>, _>(None::<String>),
        Value::Bool(flag) => query.bind::<Integer, _>(i32::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(int) => query.bind::<BigInt, _>(int),
            None => query.bind::<Double, _>(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => query.bind::<Text, _>(text.clone()),
        Value::Array(_) | Value::Object(_) => query.bind::<Text, _>(value.to_string()),
    }
}

fn validate_columns(table: &str, known: &HashSet<String>, record: &Record) -> Result<()> {
    match record.keys().find(|column| !known.contains(*column)) {
        Some(column) => Err(StorageError::UnknownColumn {
            table: table.to_string(),
            column: column.clone(),
        }),
        None => Ok(()),
    }
}

/// [`StoreAdapter`] over the edge-local SQLite database.
pub struct SqliteStore {
    pool: Arc<DbPool>,
    writer: WriteHandle,
    tombstones: TombstoneRepository,
    columns_cache: Mutex<HashMap<String, Vec<String>>>,
}

impl SqliteStore {
    pub fn new(pool: Arc<DbPool>, writer: WriteHandle) -> Self {
        Self {
            tombstones: TombstoneRepository::new(pool.clone(), writer.clone()),
            pool,
            writer,
            columns_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Cheap round trip used by the health endpoint.
    pub async fn ping(&self) -> Result<()> {
        self.read(|conn| {
            diesel::sql_query("SELECT 1").execute(conn)?;
            Ok(())
        })
        .await
    }

    async fn read<F, T>(&self, job: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = get_connection(&pool)?;
            job(&mut conn)
        })
        .await
        .map_err(|err| StorageError::Task(err.to_string()))?
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        if let Some(columns) = self.cached_columns(table) {
            return Ok(columns);
        }

        let table_name = table.to_string();
        let columns = self
            .read(move |conn| load_table_columns(conn, &table_name))
            .await?;
        if let Ok(mut cache) = self.columns_cache.lock() {
            cache.insert(table.to_string(), columns.clone());
        }
        Ok(columns)
    }

    fn cached_columns(&self, table: &str) -> Option<Vec<String>> {
        self.columns_cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(table).cloned())
    }

    async fn known_columns(&self, table: &str) -> Result<HashSet<String>> {
        Ok(self.table_columns(table).await?.into_iter().collect())
    }

    async fn select_rows(&self, table: &str) -> Result<Vec<Record>> {
        let columns = self.table_columns(table).await?;
        let sql = select_rows_sql(table, &columns);
        self.read(move |conn| {
            diesel::sql_query(sql)
                .load::<JsonRow>(conn)?
                .iter()
                .map(|row| merge_row_chunks(&row.payload))
                .collect()
        })
        .await
    }

    async fn insert_row(&self, table: &str, record: &Record) -> Result<()> {
        if record.is_empty() {
            return Err(StorageError::EmptyRecord(table.to_string()));
        }
        validate_columns(table, &self.known_columns(table).await?, record)?;

        let column_list = record
            .keys()
            .map(|column| quote_identifier(column))
            .collect::<Vec<_>>()
            .join(", ");
        let placeholders = vec!["?"; record.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_identifier(table),
            column_list,
            placeholders
        );
        let values = record.values().cloned().collect::<Vec<_>>();

        self.writer
            .exec(move |conn| {
                let query = values
                    .iter()
                    .fold(diesel::sql_query(sql).into_boxed::<Sqlite>(), bind_value);
                query.execute(conn)?;
                Ok(())
            })
            .await
    }

    /// Returns the number of rows the identifier matched.
    async fn update_row(&self, table: &str, identifier: &Identifier, patch: &Record) -> Result<u64> {
        let known = self.known_columns(table).await?;
        validate_columns(table, &known, patch)?;
        if !known.contains(&identifier.field) {
            return Err(StorageError::UnknownColumn {
                table: table.to_string(),
                column: identifier.field.clone(),
            });
        }
        if patch.is_empty() {
            return Err(StorageError::EmptyRecord(table.to_string()));
        }

        let assignments = patch
            .keys()
            .map(|column| format!("{} = ?", quote_identifier(column)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            quote_identifier(table),
            assignments,
            quote_identifier(&identifier.field)
        );
        let mut values = patch.values().cloned().collect::<Vec<_>>();
        values.push(identifier.value.clone());

        self.writer
            .exec(move |conn| {
                let query = values
                    .iter()
                    .fold(diesel::sql_query(sql).into_boxed::<Sqlite>(), bind_value);
                Ok(query.execute(conn)? as u64)
            })
            .await
    }

    async fn delete_row(&self, table: &str, identifier: &Identifier) -> Result<()> {
        let known = self.known_columns(table).await?;
        if !known.contains(&identifier.field) {
            return Err(StorageError::UnknownColumn {
                table: table.to_string(),
                column: identifier.field.clone(),
            });
        }

        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            quote_identifier(table),
            quote_identifier(&identifier.field)
        );
        let value = identifier.value.clone();
        self.writer
            .exec(move |conn| {
                bind_value(diesel::sql_query(sql).into_boxed::<Sqlite>(), &value).execute(conn)?;
                Ok(())
            })
            .await
    }

    async fn count_rows(&self, table: &str) -> Result<u64> {
        // Resolving columns first turns a missing table into `UnknownTable`.
        self.table_columns(table).await?;
        let sql = format!("SELECT COUNT(*) AS count FROM {}", quote_identifier(table));
        let row = self
            .read(move |conn| Ok(diesel::sql_query(sql).get_result::<CountRow>(conn)?))
            .await?;
        Ok(u64::try_from(row.count).unwrap_or_default())
    }
}

#[async_trait]
impl StoreAdapter for SqliteStore {
    fn name(&self) -> &'static str {
        "local"
    }

    fn json_encoding(&self) -> JsonEncoding {
        JsonEncoding::Text
    }

    async fn select(&self, table: &str) -> StoreResult<Vec<Record>> {
        Ok(self.select_rows(table).await?)
    }

    async fn insert(&self, table: &str, record: &Record) -> StoreResult<()> {
        Ok(self.insert_row(table, record).await?)
    }

    async fn update(&self, table: &str, identifier: &Identifier, patch: &Record) -> StoreResult<u64> {
        Ok(self.update_row(table, identifier, patch).await?)
    }

    async fn delete(&self, table: &str, identifier: &Identifier) -> StoreResult<()> {
        Ok(self.delete_row(table, identifier).await?)
    }

    async fn columns(&self, table: &str) -> StoreResult<HashSet<String>> {
        Ok(self.known_columns(table).await?)
    }

    async fn count(&self, table: &str) -> StoreResult<u64> {
        Ok(self.count_rows(table).await?)
    }

    async fn record_tombstone(&self, table: &str, identifier: &Identifier) -> StoreResult<()> {
        Ok(self.tombstones.record(table, identifier).await?)
    }

    async fn clear_tombstone(&self, table: &str, identifier: &Identifier) -> StoreResult<()> {
        Ok(self.tombstones.clear(table, identifier).await?)
    }

    async fn tombstones(&self, table: &str) -> StoreResult<HashSet<String>> {
        Ok(self.tombstones.keys_for_table(table).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_pool, init, run_migrations, spawn_writer};
    use edgesync_core::sync::testing::MemoryStore;
    use edgesync_core::sync::{ReconciliationEngine, SyncContext, SyncSettings, TableRegistry};
    use edgesync_core::StoreError;
    use serde_json::json;
    use tempfile::tempdir;

    const USERS_DDL: &str = "CREATE TABLE users (
        uuid TEXT PRIMARY KEY,
        email TEXT UNIQUE,
        name TEXT,
        mobile_phone TEXT,
        last_online TEXT,
        updated_at TEXT
    )";
    const SITES_DDL: &str = "CREATE TABLE sites (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        slug TEXT UNIQUE,
        name TEXT,
        settings TEXT,
        published INTEGER DEFAULT 0,
        updated_at TEXT
    )";

    fn record(value: Value) -> Record {
        value.as_object().cloned().expect("object")
    }

    fn setup_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempdir().expect("tempdir");
        let db_path = init(&dir.path().join("edge.db").to_string_lossy()).expect("init db");
        run_migrations(&db_path).expect("migrate db");
        let pool = create_pool(&db_path).expect("create pool");
        {
            let mut conn = get_connection(&pool).expect("conn");
            diesel::sql_query(USERS_DDL).execute(&mut conn).expect("users table");
            diesel::sql_query(SITES_DDL).execute(&mut conn).expect("sites table");
        }
        let writer = spawn_writer(pool.as_ref().clone());
        (dir, SqliteStore::new(pool, writer))
    }

    #[tokio::test]
    async fn select_returns_typed_json_rows() {
        let (_dir, store) = setup_store();
        store
            .insert(
                "sites",
                &record(json!({ "slug": "bakery", "settings": "{\"theme\":\"dark\"}", "published": true })),
            )
            .await
            .expect("insert");

        let rows = store.select("sites").await.expect("select");

        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row["id"], json!(1));
        assert_eq!(row["slug"], json!("bakery"));
        assert_eq!(row["settings"], json!("{\"theme\":\"dark\"}"));
        assert_eq!(row["published"], json!(1));
        assert_eq!(row["name"], Value::Null);
    }

    #[tokio::test]
    async fn duplicate_key_maps_to_unique_violation() {
        let (_dir, store) = setup_store();
        let row = record(json!({ "uuid": "u1", "email": "a@x.com" }));
        store.insert("users", &row).await.expect("first insert");

        let err = store.insert("users", &row).await.expect_err("duplicate");

        assert!(err.is_unique_violation(), "{err:?}");
    }

    #[tokio::test]
    async fn unknown_columns_are_rejected_before_writing() {
        let (_dir, store) = setup_store();
        let err = store
            .insert("users", &record(json!({ "uuid": "u1", "legacy": 1 })))
            .await
            .expect_err("unknown column");
        assert_eq!(err, StoreError::unknown_column("users", "legacy"));
        assert_eq!(store.count("users").await.expect("count"), 0);
    }

    #[tokio::test]
    async fn values_are_bound_not_interpolated() {
        let (_dir, store) = setup_store();
        let hostile = "x'); DROP TABLE users; --";
        store
            .insert("users", &record(json!({ "uuid": "u1", "name": hostile })))
            .await
            .expect("insert");

        let rows = store.select("users").await.expect("select");
        assert_eq!(rows[0]["name"], json!(hostile));
    }

    #[tokio::test]
    async fn update_and_delete_target_the_identifier() {
        let (_dir, store) = setup_store();
        store
            .insert("users", &record(json!({ "uuid": "u1", "email": "a@x.com" })))
            .await
            .expect("insert");
        store
            .insert("users", &record(json!({ "uuid": "u2", "email": "b@x.com" })))
            .await
            .expect("insert");

        let matched = store
            .update(
                "users",
                &Identifier::new("email", "a@x.com"),
                &record(json!({ "name": "Alice", "mobile_phone": null })),
            )
            .await
            .expect("update");
        assert_eq!(matched, 1);
        store
            .delete("users", &Identifier::new("uuid", "u2"))
            .await
            .expect("delete");

        let rows = store.select("users").await.expect("select");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("Alice"));
    }

    #[tokio::test]
    async fn update_of_a_missing_row_matches_nothing() {
        let (_dir, store) = setup_store();
        let matched = store
            .update("users", &Identifier::new("uuid", "ghost"), &record(json!({ "name": "X" })))
            .await
            .expect("update");
        assert_eq!(matched, 0);
    }

    #[tokio::test]
    async fn empty_rows_are_not_written() {
        let (_dir, store) = setup_store();
        let err = store.insert("users", &Record::new()).await.expect_err("empty row");
        assert!(matches!(err, StoreError::Rejected(_)));
        assert_eq!(store.count("users").await.expect("count"), 0);
    }

    #[tokio::test]
    async fn numeric_ids_match_string_identifiers() {
        let (_dir, store) = setup_store();
        store
            .insert("sites", &record(json!({ "id": 7, "slug": "seven" })))
            .await
            .expect("insert");

        store
            .update("sites", &Identifier::new("id", "7"), &record(json!({ "name": "Seven" })))
            .await
            .expect("update");

        let rows = store.select("sites").await.expect("select");
        assert_eq!(rows[0]["name"], json!("Seven"));
    }

    #[tokio::test]
    async fn columns_and_counts_reflect_the_schema() {
        let (_dir, store) = setup_store();
        let columns = store.columns("users").await.expect("columns");
        assert!(columns.contains("last_online"));
        assert_eq!(columns.len(), 6);

        let err = store.count("crm_deals").await.expect_err("missing table");
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn tombstones_round_trip_through_the_adapter() {
        let (_dir, store) = setup_store();
        let id = Identifier::new("uuid", "u1");

        store.record_tombstone("users", &id).await.expect("record");
        assert!(store
            .tombstones("users")
            .await
            .expect("tombstones")
            .contains("uuid:u1"));

        store.clear_tombstone("users", &id).await.expect("clear");
        assert!(store.tombstones("users").await.expect("tombstones").is_empty());
    }

    #[tokio::test]
    async fn reconciles_against_a_cloud_store() {
        let (_dir, store) = setup_store();
        store
            .insert(
                "users",
                &record(json!({ "uuid": "u1", "email": "a@x.com", "name": "A" })),
            )
            .await
            .expect("seed local");
        let local = Arc::new(store);
        let cloud = Arc::new(MemoryStore::cloud().with_table(
            "users",
            &["uuid", "email", "name", "mobile_phone", "last_online", "updated_at"],
            &["uuid", "email"],
        ));
        cloud.seed(
            "users",
            vec![
                json!({ "uuid": "u1", "email": "a@x.com", "name": null, "last_online": "2024-01-01T00:00:00Z" }),
                json!({ "uuid": "u2", "email": "b@x.com", "name": "B", "avatar": "ignored" }),
            ],
        );
        let engine = ReconciliationEngine::new(SyncContext::new(
            local.clone(),
            cloud.clone(),
            Arc::new(TableRegistry::default()),
            SyncSettings::default(),
        ));

        let results = engine.reconcile_all(&["users"]).await;

        let outcome = &results["users"];
        assert!(outcome.is_clean(), "{:?}", outcome.errors);
        assert_eq!(outcome.cloud_to_local_inserted, 1);
        assert_eq!(outcome.local_updated, 1);
        assert_eq!(outcome.cloud_updated, 1);
        assert_eq!(local.count("users").await.expect("count"), 2);
        assert_eq!(cloud.find("users", "uuid", "u1").expect("row")["name"], json!("A"));

        let second = engine.reconcile_all(&["users"]).await;
        assert_eq!(second["users"].changes(), 0);
    }
}
