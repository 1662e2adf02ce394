//! Core of the edge/cloud replication subsystem.
//!
//! Everything here is store-agnostic: the table registry, record normalization,
//! the [`sync::StoreAdapter`] contract, and the three sync triggers (per-mutation
//! propagation, full reconciliation, scheduled reconciliation). Concrete stores
//! live in `edgesync-storage-sqlite` and `edgesync-cloud-store`.

pub mod errors;
pub mod sync;

pub use errors::{Error, Result, StoreError, StoreResult};
