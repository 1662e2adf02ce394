//! Sync status, manual reconciliation and out-of-process mutation intake.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use edgesync_core::sync::{
    ReconcileScope, SyncCycleTrigger, SyncOperation, SyncOutcome, SyncService, TableSyncStatus,
};

use crate::error::{ApiError, ApiResult};
use crate::main_lib::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ReconcileQuery {
    #[serde(default)]
    pub scope: ReconcileScope,
}

#[derive(Debug, Deserialize)]
pub struct MutationRequest {
    pub table: String,
    pub operation: SyncOperation,
    pub record: Value,
}

fn sync_service(state: &AppState) -> ApiResult<&Arc<SyncService>> {
    state.sync.as_ref().ok_or(ApiError::SyncNotConfigured)
}

/// Checks `Authorization: Bearer <token>` when an admin token is configured.
fn authorize(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Ok(());
    };
    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);
    match provided {
        Some(token) if token == expected => Ok(()),
        _ => Err(ApiError::Unauthorized("Invalid or missing admin token".to_string())),
    }
}

async fn get_sync_status(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<TableSyncStatus>>> {
    let service = sync_service(&state)?;
    Ok(Json(service.status().await))
}

async fn trigger_reconcile(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReconcileQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<BTreeMap<String, SyncOutcome>>> {
    authorize(&state, &headers)?;
    let service = sync_service(&state)?;

    info!(
        "[Sync] {:?} reconciliation requested ({:?})",
        SyncCycleTrigger::Manual,
        query.scope
    );
    let outcomes = service.trigger_reconciliation(query.scope).await?;
    Ok(Json(outcomes))
}

async fn accept_mutation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MutationRequest>,
) -> ApiResult<StatusCode> {
    let service = sync_service(&state)?;
    let Value::Object(record) = body.record else {
        return Err(ApiError::BadRequest("record must be a JSON object".to_string()));
    };

    debug!("[Sync] Accepted {} on {}", body.operation, body.table);
    // The propagation outcome is logged by the propagator; the handle is not awaited.
    drop(service.on_mutation(&body.table, body.operation, record)?);
    Ok(StatusCode::ACCEPTED)
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sync/status", get(get_sync_status))
        .route("/sync/reconcile", post(trigger_reconcile))
        .route("/sync/mutations", post(accept_mutation))
}
