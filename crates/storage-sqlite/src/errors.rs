//! Storage-layer errors and their mapping onto store-level failures.

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

use edgesync_core::StoreError;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(#[from] diesel::ConnectionError),

    #[error("Connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error("Query failed: {0}")]
    Query(#[from] DieselError),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Table '{0}' does not exist")]
    UnknownTable(String),

    #[error("Column '{column}' is not valid for table '{table}'")]
    UnknownColumn { table: String, column: String },

    #[error("Refusing to write an empty row to '{0}'")]
    EmptyRecord(String),

    #[error("Row payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Database writer is not running")]
    WriterClosed,

    #[error("Blocking task failed: {0}")]
    Task(String),
}

fn is_busy_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("database is locked") || lower.contains("database is busy")
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Query(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info)) => {
                StoreError::UniqueViolation(info.message().to_string())
            }
            StorageError::Query(DieselError::DatabaseError(_, info)) if is_busy_message(info.message()) => {
                StoreError::unavailable(info.message())
            }
            StorageError::UnknownColumn { table, column } => StoreError::UnknownColumn { table, column },
            StorageError::Pool(_) | StorageError::WriterClosed | StorageError::Task(_) => {
                StoreError::unavailable(err.to_string())
            }
            other => StoreError::rejected(other.to_string()),
        }
    }
}
