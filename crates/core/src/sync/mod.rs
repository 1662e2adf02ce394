//! Edge/cloud replication: registry, stores, propagation and reconciliation.

mod context;
mod lww;
mod model;
mod outcome;
mod propagator;
mod reconcile;
mod record;
mod registry;
mod retry;
mod scheduled;
mod scheduler;
mod service;
mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use context::*;
pub use lww::*;
pub use model::*;
pub use outcome::*;
pub use propagator::*;
pub use reconcile::*;
pub use record::*;
pub use registry::*;
pub use retry::*;
pub use scheduled::*;
pub use scheduler::*;
pub use service::*;
pub use store::*;
