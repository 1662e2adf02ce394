//! Static per-table metadata that makes the sync engine generic across tables.

use serde_json::Value;

use crate::errors::{Error, Result};
use crate::sync::record::{value_key, Record};

/// Columns a table is allowed to propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncableColumns {
    /// Every column the target schema reports.
    All,
    /// Only the listed columns.
    Only(&'static [&'static str]),
}

impl SyncableColumns {
    pub fn allows(&self, column: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(columns) => columns.contains(&column),
        }
    }
}

/// Sync metadata for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    pub name: &'static str,
    pub primary_key: &'static str,
    /// Unique natural keys, tried in order when the primary key is missing.
    pub fallback_keys: &'static [&'static str],
    pub syncable_columns: SyncableColumns,
    /// Columns stored as text locally and as native JSON in the cloud.
    pub json_columns: &'static [&'static str],
    /// Recency markers, most authoritative first.
    pub recency_fields: &'static [&'static str],
}

impl TableDescriptor {
    pub const fn new(name: &'static str, primary_key: &'static str) -> Self {
        Self {
            name,
            primary_key,
            fallback_keys: &[],
            syncable_columns: SyncableColumns::All,
            json_columns: &[],
            recency_fields: &["updated_at"],
        }
    }

    pub const fn with_fallback_keys(mut self, keys: &'static [&'static str]) -> Self {
        self.fallback_keys = keys;
        self
    }

    pub const fn with_columns(mut self, columns: &'static [&'static str]) -> Self {
        self.syncable_columns = SyncableColumns::Only(columns);
        self
    }

    pub const fn with_json_columns(mut self, columns: &'static [&'static str]) -> Self {
        self.json_columns = columns;
        self
    }

    pub const fn with_recency_fields(mut self, fields: &'static [&'static str]) -> Self {
        self.recency_fields = fields;
        self
    }

    /// Primary key followed by the fallback keys.
    pub fn identifier_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        std::iter::once(self.primary_key).chain(self.fallback_keys.iter().copied())
    }

    pub fn is_identifier_field(&self, column: &str) -> bool {
        self.identifier_fields().any(|field| field == column)
    }

    /// True when the column may be written by the sync engine.
    ///
    /// Identifier fields are always allowed so a row can be created on the other side.
    pub fn allows_column(&self, column: &str) -> bool {
        self.is_identifier_field(column) || self.syncable_columns.allows(column)
    }

    pub fn is_json_column(&self, column: &str) -> bool {
        self.json_columns.contains(&column)
    }
}

/// Field/value pair used to target a row on the other store.
#[derive(Debug, Clone, PartialEq)]
pub struct Identifier {
    pub field: String,
    pub value: Value,
}

impl Identifier {
    pub fn new(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Canonical string form of the value (`42` and `"42"` are the same row).
    pub fn key(&self) -> String {
        value_key(&self.value).unwrap_or_default()
    }

    /// Key used to look the identifier up in a tombstone set.
    pub fn tombstone_key(&self) -> String {
        tombstone_key(&self.field, &self.key())
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.field, self.key())
    }
}

pub fn tombstone_key(field: &str, key: &str) -> String {
    format!("{}:{}", field, key)
}

/// Non-empty identifier value for `field`, if the record carries one.
pub fn identifier_for_field(record: &Record, field: &str) -> Option<Identifier> {
    let value = record.get(field)?;
    value_key(value).map(|_| Identifier::new(field, value.clone()))
}

/// Best available unique field for targeting the row on the other store.
///
/// Primary key when present and non-empty, otherwise the first non-empty
/// fallback key, otherwise `None` (the row can only be inserted).
pub fn resolve_identifier(descriptor: &TableDescriptor, record: &Record) -> Option<Identifier> {
    descriptor
        .identifier_fields()
        .find_map(|field| identifier_for_field(record, field))
}

const USER_COLUMNS: &[&str] = &[
    "uuid",
    "email",
    "name",
    "preferred_name",
    "mobile_phone",
    "country",
    "postal_code",
    "address",
    "avatar_url",
    "preferred_language",
    "subscription_plan",
    "subscription_status",
    "bio",
    "company_name",
    "created_at",
    "updated_at",
    "last_online",
];

const USER_PRODUCT_COLUMNS: &[&str] = &[
    "id",
    "user_uuid",
    "product_id",
    "product_type",
    "product_name",
    "product_status",
    "status",
    "active",
    "metadata",
    "expires_at",
    "created_at",
    "updated_at",
    "subscribed_at",
    "cancelled_at",
    "sites_created",
    "consultations_made",
    "api_calls",
    "product_settings",
];

const SITE_COLUMNS: &[&str] = &[
    "id",
    "user_uuid",
    "slug",
    "name",
    "description",
    "business_type",
    "status",
    "settings",
    "created_at",
    "updated_at",
    "published_at",
];

/// Every synced table, parents before children so inserts respect foreign keys.
pub const SYNC_TABLES: &[TableDescriptor] = &[
    TableDescriptor::new("users", "uuid")
        .with_fallback_keys(&["email"])
        .with_columns(USER_COLUMNS)
        .with_recency_fields(&["updated_at", "last_online"]),
    TableDescriptor::new("user_products", "id")
        .with_columns(USER_PRODUCT_COLUMNS)
        .with_json_columns(&["metadata", "product_settings"]),
    TableDescriptor::new("sites", "id")
        .with_fallback_keys(&["slug"])
        .with_columns(SITE_COLUMNS)
        .with_json_columns(&["settings"]),
    TableDescriptor::new("billing_history", "id"),
    TableDescriptor::new("pricing_stores", "id"),
    TableDescriptor::new("pricing_products", "id"),
    TableDescriptor::new("pricing_hidden_costs", "id").with_json_columns(&["auxiliary_data"]),
    TableDescriptor::new("pricing_indirect_costs", "id"),
    TableDescriptor::new("pricing_tax_config", "id"),
    TableDescriptor::new("pricing_tax_items", "id"),
    TableDescriptor::new("usage_logs", "id"),
    TableDescriptor::new("crm_companies", "id"),
    TableDescriptor::new("crm_contacts", "id"),
    TableDescriptor::new("crm_deals", "id"),
    TableDescriptor::new("crm_activities", "id"),
    TableDescriptor::new("crm_tasks", "id"),
    TableDescriptor::new("crm_deal_metrics", "id"),
];

/// High-churn tables covered by the periodic driver.
pub const SCHEDULED_SYNC_TABLES: &[&str] = &["users", "sites", "user_products"];

/// Immutable lookup over the table descriptors.
#[derive(Debug, Clone)]
pub struct TableRegistry {
    tables: Vec<TableDescriptor>,
    scheduled: Vec<&'static str>,
}

impl Default for TableRegistry {
    fn default() -> Self {
        Self::new(SYNC_TABLES.to_vec(), SCHEDULED_SYNC_TABLES.to_vec())
    }
}

impl TableRegistry {
    pub fn new(tables: Vec<TableDescriptor>, scheduled: Vec<&'static str>) -> Self {
        Self { tables, scheduled }
    }

    pub fn get(&self, table: &str) -> Result<&TableDescriptor> {
        self.tables
            .iter()
            .find(|descriptor| descriptor.name == table)
            .ok_or_else(|| Error::UnknownTable(table.to_string()))
    }

    /// All registered tables in foreign-key-safe order.
    pub fn full_sync_order(&self) -> Vec<&'static str> {
        self.tables.iter().map(|descriptor| descriptor.name).collect()
    }

    /// `(table, primary key)` for every registered table.
    pub fn primary_keys(&self) -> impl Iterator<Item = (&'static str, &'static str)> + '_ {
        self.tables
            .iter()
            .map(|descriptor| (descriptor.name, descriptor.primary_key))
    }

    /// The subset driven by the periodic timer, in registry order.
    pub fn scheduled_tables(&self) -> Vec<&'static str> {
        self.tables
            .iter()
            .map(|descriptor| descriptor.name)
            .filter(|name| self.scheduled.contains(name))
            .collect()
    }

    pub fn resolve_identifier(&self, table: &str, record: &Record) -> Result<Option<Identifier>> {
        Ok(resolve_identifier(self.get(table)?, record))
    }
}
