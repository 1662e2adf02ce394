//! Error types for the PostgREST client.

use thiserror::Error;

use edgesync_core::sync::{classify_http_status, SyncRetryClass};
use edgesync_core::StoreError;

/// Result type alias for cloud store operations.
pub type Result<T> = std::result::Result<T, CloudStoreError>;

/// PostgreSQL `unique_violation`.
const PG_UNIQUE_VIOLATION: &str = "23505";

fn code_suffix(code: &Option<String>) -> String {
    code.as_deref().map(|c| format!(", {}", c)).unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum CloudStoreError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error response from PostgREST, with the PostgreSQL or PostgREST code when present
    #[error("API error ({status}{}): {message}", code_suffix(.code))]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    /// Invalid request (bad configuration, malformed response headers)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl CloudStoreError {
    pub fn api(status: u16, code: Option<String>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// HTTP status if this is an API error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Api { status, code, .. } => {
                *status == 409 || code.as_deref() == Some(PG_UNIQUE_VIOLATION)
            }
            _ => false,
        }
    }

    /// Classify error for retry policy.
    pub fn retry_class(&self) -> SyncRetryClass {
        match self {
            Self::Api { status, .. } => classify_http_status(*status),
            Self::Http(_) => SyncRetryClass::Retryable,
            Self::Json(_) | Self::InvalidRequest(_) => SyncRetryClass::Permanent,
        }
    }
}

impl From<CloudStoreError> for StoreError {
    fn from(err: CloudStoreError) -> Self {
        if err.is_unique_violation() {
            return StoreError::UniqueViolation(err.to_string());
        }
        match err.retry_class() {
            SyncRetryClass::Retryable => StoreError::unavailable(err.to_string()),
            SyncRetryClass::ReauthRequired => StoreError::Unauthorized(err.to_string()),
            SyncRetryClass::Permanent => StoreError::rejected(err.to_string()),
        }
    }
}
