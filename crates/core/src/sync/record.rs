//! Entity records and the normalization applied before a record crosses stores.

use std::collections::HashSet;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::errors::{Error, Result};
use crate::sync::registry::TableDescriptor;

/// One row: column name to scalar or JSON value.
pub type Record = serde_json::Map<String, Value>;

/// Internal payload markers that never leave the process.
pub const INTERNAL_MARKERS: &[&str] = &["_sync_source"];

/// How a store represents JSON-typed columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonEncoding {
    /// Structured JSON values (PostgREST jsonb).
    Native,
    /// JSON serialized into a text column (SQLite).
    Text,
}

/// True for `null` and for a missing column.
pub fn is_null(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

/// Canonical comparison key for an identifier value.
///
/// Returns `None` for null and empty strings, which never identify a row.
pub fn value_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Current time in the RFC 3339 form written to recency columns.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Converts JSON-typed columns to the representation the target store expects.
///
/// Text to native parses string-encoded JSON. Malformed JSON is left as the
/// original string.
pub fn encode_json_columns(descriptor: &TableDescriptor, record: &mut Record, encoding: JsonEncoding) {
    for column in descriptor.json_columns {
        let Some(value) = record.get_mut(*column) else {
            continue;
        };
        match encoding {
            JsonEncoding::Native => {
                if let Value::String(raw) = value {
                    if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
                        if parsed.is_object() || parsed.is_array() {
                            *value = parsed;
                        }
                    }
                }
            }
            JsonEncoding::Text => {
                if value.is_object() || value.is_array() {
                    *value = Value::String(value.to_string());
                }
            }
        }
    }
}

/// Payload sent by the propagator for a single mutation.
///
/// Drops internal markers and columns outside the allow-list, stamps the
/// primary recency field when the caller did not set one, and encodes JSON
/// columns for the target.
pub fn normalize_for_propagation(
    descriptor: &TableDescriptor,
    record: &Record,
    encoding: JsonEncoding,
) -> Record {
    let mut normalized: Record = record
        .iter()
        .filter(|(column, _)| !INTERNAL_MARKERS.contains(&column.as_str()))
        .filter(|(column, _)| descriptor.allows_column(column))
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect();

    if let Some(field) = descriptor.recency_fields.first() {
        if descriptor.allows_column(field) && is_null(normalized.get(*field)) {
            normalized.insert((*field).to_string(), Value::String(now_timestamp()));
        }
    }

    encode_json_columns(descriptor, &mut normalized, encoding);
    normalized
}

/// Row to create on the other store during reconciliation.
///
/// Keeps only columns the target schema has and the table allows; null values
/// are left out so the target's defaults apply.
pub fn prepare_insert(
    descriptor: &TableDescriptor,
    record: &Record,
    target_columns: &HashSet<String>,
    encoding: JsonEncoding,
) -> Result<Record> {
    let mut prepared: Record = record
        .iter()
        .filter(|(column, value)| {
            !value.is_null()
                && target_columns.contains(column.as_str())
                && descriptor.allows_column(column)
                && !INTERNAL_MARKERS.contains(&column.as_str())
        })
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect();
    if prepared.is_empty() {
        return Err(Error::InvalidRecord(format!(
            "no column of the {} row exists on the target",
            descriptor.name
        )));
    }
    encode_json_columns(descriptor, &mut prepared, encoding);
    Ok(prepared)
}

/// Columns that are null on `target` but carry a value on `source`.
///
/// Never includes a column that is already non-null on the target, nor one
/// the target schema does not know. A key missing on the target (a local user
/// matched by email but lacking `uuid`) is filled like any other column.
pub fn null_fill_patch(
    descriptor: &TableDescriptor,
    source: &Record,
    target: &Record,
    target_columns: &HashSet<String>,
    encoding: JsonEncoding,
) -> Record {
    let mut patch: Record = source
        .iter()
        .filter(|(column, value)| {
            !value.is_null()
                && is_null(target.get(column.as_str()))
                && target_columns.contains(column.as_str())
                && descriptor.allows_column(column)
                && !INTERNAL_MARKERS.contains(&column.as_str())
        })
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect();
    encode_json_columns(descriptor, &mut patch, encoding);
    patch
}

/// Full overwrite payload for the recency-biased driver.
///
/// Identifier fields are stripped so the update never rewrites a key.
pub fn overwrite_patch(
    descriptor: &TableDescriptor,
    source: &Record,
    target_columns: &HashSet<String>,
    encoding: JsonEncoding,
) -> Record {
    let mut patch: Record = source
        .iter()
        .filter(|(column, _)| {
            target_columns.contains(column.as_str())
                && descriptor.allows_column(column)
                && !descriptor.is_identifier_field(column)
                && !INTERNAL_MARKERS.contains(&column.as_str())
        })
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect();
    encode_json_columns(descriptor, &mut patch, encoding);
    patch
}

/// Recency markers to compare for a local/cloud pair.
///
/// Both values come from the same field: the first recency field that is set
/// on either row. The row missing that field gets `None`.
pub fn recency_pair<'a, 'b>(
    descriptor: &TableDescriptor,
    local: &'a Record,
    cloud: &'b Record,
) -> (Option<&'a str>, Option<&'b str>) {
    fn marker<'r>(record: &'r Record, field: &str) -> Option<&'r str> {
        record.get(field).and_then(Value::as_str)
    }
    match descriptor
        .recency_fields
        .iter()
        .copied()
        .find(|field| marker(local, field).is_some() || marker(cloud, field).is_some())
    {
        Some(field) => (marker(local, field), marker(cloud, field)),
        None => (None, None),
    }
}
