//! Error types shared by the sync engine and the store adapters.

use std::time::Duration;

use thiserror::Error;

use crate::sync::SyncRetryClass;

/// Result type alias for engine-level operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for a single store call.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failure of one call against one store.
///
/// Adapters translate their native errors (diesel, HTTP, PostgREST codes) into
/// this shape so the engine can decide between the update fallback, a retry,
/// or giving up on the row.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The row collides with an existing unique key on the target.
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    /// The payload names a column the target table does not have.
    #[error("Column '{column}' is not valid for table '{table}'")]
    UnknownColumn { table: String, column: String },

    /// Transport failure, 5xx, lock contention. Worth another attempt.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The call did not finish inside the configured bound.
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// Credentials were rejected by the store.
    #[error("Store rejected credentials: {0}")]
    Unauthorized(String),

    /// Any other rejection that will not succeed on retry.
    #[error("Store rejected request: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    pub fn unknown_column(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::UnknownColumn {
            table: table.into(),
            column: column.into(),
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> SyncRetryClass {
        match self {
            Self::Unavailable(_) | Self::Timeout(_) => SyncRetryClass::Retryable,
            Self::Unauthorized(_) => SyncRetryClass::ReauthRequired,
            Self::UniqueViolation(_) | Self::UnknownColumn { .. } | Self::Rejected(_) => {
                SyncRetryClass::Permanent
            }
        }
    }
}

/// Errors raised by the sync engine itself.
#[derive(Debug, Error)]
pub enum Error {
    /// The table is not in the registry. This is a wiring bug in the caller.
    #[error("Table '{0}' is not registered for sync")]
    UnknownTable(String),

    /// No primary or fallback key could be resolved for the row.
    #[error("No identifier could be resolved for a row in '{table}'")]
    MissingIdentifier { table: String },

    /// A record did not have the expected shape.
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("{store} store: {source}")]
    Store {
        store: &'static str,
        #[source]
        source: StoreError,
    },

    /// A scheduled pass is still running; overlapping passes are refused.
    #[error("A scheduled reconciliation is already running")]
    ReconciliationInProgress,
}

impl Error {
    pub fn store(store: &'static str, source: StoreError) -> Self {
        Self::Store { store, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_failures_are_retryable() {
        assert_eq!(
            StoreError::unavailable("connection reset").retry_class(),
            SyncRetryClass::Retryable
        );
        assert_eq!(
            StoreError::Timeout(Duration::from_secs(5)).retry_class(),
            SyncRetryClass::Retryable
        );
    }

    #[test]
    fn constraint_failures_are_permanent() {
        assert_eq!(
            StoreError::UniqueViolation("users_email_key".into()).retry_class(),
            SyncRetryClass::Permanent
        );
        assert_eq!(
            StoreError::unknown_column("users", "legacy").retry_class(),
            SyncRetryClass::Permanent
        );
    }

    #[test]
    fn store_error_display_names_the_store() {
        let err = Error::store("cloud", StoreError::rejected("bad filter"));
        assert_eq!(err.to_string(), "cloud store: Store rejected request: bad filter");
    }
}
