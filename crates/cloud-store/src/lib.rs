//! PostgREST-backed cloud store for edgesync.

pub mod client;
pub mod error;

pub use client::{CloudStore, DEFAULT_TIMEOUT_SECS};
pub use error::{CloudStoreError, Result};
