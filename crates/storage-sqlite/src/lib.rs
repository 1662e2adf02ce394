//! Edge-local SQLite storage for edgesync.
//!
//! Provides the pooled database, the single-writer actor, the tombstone
//! table and [`SqliteStore`], the local [`edgesync_core::sync::StoreAdapter`].

pub mod db;
pub mod errors;
pub mod model;
pub mod schema;
pub mod store;
pub mod tombstones;

pub use db::{create_pool, get_connection, init, run_migrations, spawn_writer, DbPool, WriteHandle};
pub use errors::{Result, StorageError};
pub use store::SqliteStore;
pub use tombstones::TombstoneRepository;
