//! Operator HTTP surface.

pub mod health;
pub mod sync;

use std::sync::Arc;

use axum::Router;

use crate::main_lib::AppState;

pub fn app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router())
        .merge(sync::router())
        .with_state(state)
}
