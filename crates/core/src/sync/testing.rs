//! In-memory [`StoreAdapter`] used by engine tests and downstream crates.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::{StoreError, StoreResult};
use crate::sync::record::{value_key, JsonEncoding, Record};
use crate::sync::registry::{tombstone_key, Identifier};
use crate::sync::store::StoreAdapter;

#[derive(Debug, Default)]
struct MemoryTable {
    columns: HashSet<String>,
    unique: Vec<String>,
    rows: Vec<Record>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
    tombstones: HashMap<String, HashSet<String>>,
    write_failures: VecDeque<StoreError>,
    failing_selects: HashSet<String>,
    writes: usize,
    write_attempts: usize,
}

/// Table store held in a mutex. The lock is never held across an await.
#[derive(Debug)]
pub struct MemoryStore {
    name: &'static str,
    encoding: JsonEncoding,
    latency: Option<Duration>,
    select_latency: Option<Duration>,
    state: Mutex<MemoryState>,
}

fn row_matches(row: &Record, identifier: &Identifier) -> bool {
    let wanted = identifier.key();
    row.get(&identifier.field)
        .and_then(value_key)
        .is_some_and(|key| key == wanted)
}

impl MemoryStore {
    pub fn new(name: &'static str, encoding: JsonEncoding) -> Self {
        Self {
            name,
            encoding,
            latency: None,
            select_latency: None,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Local-flavoured store: JSON columns as text.
    pub fn local() -> Self {
        Self::new("local", JsonEncoding::Text)
    }

    /// Cloud-flavoured store: JSON columns as native values.
    pub fn cloud() -> Self {
        Self::new("cloud", JsonEncoding::Native)
    }

    /// Every call sleeps for `latency` before touching state.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Extra delay on `select` only, like a slow multi-page read.
    pub fn with_select_latency(mut self, latency: Duration) -> Self {
        self.select_latency = Some(latency);
        self
    }

    pub fn with_table(self, table: &str, columns: &[&str], unique: &[&str]) -> Self {
        self.lock().tables.insert(
            table.to_string(),
            MemoryTable {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                unique: unique.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
            },
        );
        self
    }

    /// Inserts rows directly, bypassing constraint checks.
    pub fn seed(&self, table: &str, rows: Vec<Value>) {
        let mut state = self.lock();
        let entry = state.tables.entry(table.to_string()).or_default();
        for row in rows {
            if let Value::Object(record) = row {
                entry.rows.push(record);
            }
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn find(&self, table: &str, field: &str, value: impl Into<Value>) -> Option<Record> {
        let identifier = Identifier::new(field, value);
        self.rows(table).into_iter().find(|row| row_matches(row, &identifier))
    }

    /// The next write calls fail with these errors, in order.
    pub fn fail_writes(&self, errors: Vec<StoreError>) {
        self.lock().write_failures.extend(errors);
    }

    pub fn fail_selects(&self, table: &str) {
        self.lock().failing_selects.insert(table.to_string());
    }

    pub fn add_tombstone(&self, table: &str, identifier: &Identifier) {
        self.lock()
            .tombstones
            .entry(table.to_string())
            .or_default()
            .insert(identifier.tombstone_key());
    }

    /// Successful writes (insert, update, delete) so far.
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    /// Write calls so far, including failed ones.
    pub fn write_attempts(&self) -> usize {
        self.lock().write_attempts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn begin_write(&self, state: &mut MemoryState) -> StoreResult<()> {
        state.write_attempts += 1;
        match state.write_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn table_mut<'a>(state: &'a mut MemoryState, table: &str) -> StoreResult<&'a mut MemoryTable> {
    state
        .tables
        .get_mut(table)
        .ok_or_else(|| StoreError::rejected(format!("relation \"{}\" does not exist", table)))
}

fn check_columns(table: &str, known: &HashSet<String>, record: &Record) -> StoreResult<()> {
    match record.keys().find(|column| !known.contains(*column)) {
        Some(column) => Err(StoreError::unknown_column(table, column.clone())),
        None => Ok(()),
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    fn name(&self) -> &'static str {
        self.name
    }

    fn json_encoding(&self) -> JsonEncoding {
        self.encoding
    }

    async fn select(&self, table: &str) -> StoreResult<Vec<Record>> {
        self.simulate_latency().await;
        if let Some(latency) = self.select_latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.lock();
        if state.failing_selects.contains(table) {
            return Err(StoreError::unavailable(format!("select {} failed", table)));
        }
        Ok(table_mut(&mut state, table)?.rows.clone())
    }

    async fn insert(&self, table: &str, record: &Record) -> StoreResult<()> {
        self.simulate_latency().await;
        let mut state = self.lock();
        self.begin_write(&mut state)?;
        let entry = table_mut(&mut state, table)?;
        check_columns(table, &entry.columns, record)?;

        for field in &entry.unique {
            let Some(key) = record.get(field).and_then(value_key) else {
                continue;
            };
            let identifier = Identifier::new(field.clone(), key);
            if entry.rows.iter().any(|row| row_matches(row, &identifier)) {
                return Err(StoreError::UniqueViolation(format!("{}_{}_key", table, field)));
            }
        }

        entry.rows.push(record.clone());
        state.writes += 1;
        Ok(())
    }

    async fn update(&self, table: &str, identifier: &Identifier, patch: &Record) -> StoreResult<u64> {
        self.simulate_latency().await;
        let mut state = self.lock();
        self.begin_write(&mut state)?;
        let entry = table_mut(&mut state, table)?;
        check_columns(table, &entry.columns, patch)?;

        let mut matched = 0;
        for row in entry.rows.iter_mut().filter(|row| row_matches(row, identifier)) {
            for (column, value) in patch {
                row.insert(column.clone(), value.clone());
            }
            matched += 1;
        }
        state.writes += 1;
        Ok(matched)
    }

    async fn delete(&self, table: &str, identifier: &Identifier) -> StoreResult<()> {
        self.simulate_latency().await;
        let mut state = self.lock();
        self.begin_write(&mut state)?;
        let entry = table_mut(&mut state, table)?;
        entry.rows.retain(|row| !row_matches(row, identifier));
        state.writes += 1;
        Ok(())
    }

    async fn columns(&self, table: &str) -> StoreResult<HashSet<String>> {
        self.simulate_latency().await;
        let mut state = self.lock();
        Ok(table_mut(&mut state, table)?.columns.clone())
    }

    async fn count(&self, table: &str) -> StoreResult<u64> {
        self.simulate_latency().await;
        let mut state = self.lock();
        Ok(table_mut(&mut state, table)?.rows.len() as u64)
    }

    async fn record_tombstone(&self, table: &str, identifier: &Identifier) -> StoreResult<()> {
        self.add_tombstone(table, identifier);
        Ok(())
    }

    async fn clear_tombstone(&self, table: &str, identifier: &Identifier) -> StoreResult<()> {
        if let Some(keys) = self.lock().tombstones.get_mut(table) {
            keys.remove(&tombstone_key(&identifier.field, &identifier.key()));
        }
        Ok(())
    }

    async fn tombstones(&self, table: &str) -> StoreResult<HashSet<String>> {
        Ok(self.lock().tombstones.get(table).cloned().unwrap_or_default())
    }
}
