//! Sync API endpoints
//!
//! Local control surface for the sync engine: queue edits, watch status,
//! trigger drains and resolve conflicts.

use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::sync::{
    ConflictDetails, ConnectivityState, DrainReport, EntityType, MutationKind, PendingMutation,
    Resolution, ServerEntity, SyncProgress, SyncStatus, TempId,
};

/// Create the sync router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(get_all_status))
        .route("/status/:entity_id", get(get_entity_status))
        .route("/mutations", post(enqueue_mutation))
        .route("/snapshots", post(record_snapshot))
        .route("/trigger", post(trigger_sync))
        .route("/conflicts/:entity_id", get(get_conflict))
        .route("/conflicts/:entity_id/resolve", post(resolve_conflict))
        .route("/connectivity", put(report_connectivity))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub statuses: HashMap<String, SyncStatus>,
    pub errors: HashMap<String, String>,
    pub conflicts: Vec<String>,
    pub pending: usize,
    pub progress: Option<SyncProgress>,
    pub connectivity: ConnectivityState,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityStatusResponse {
    pub entity_id: String,
    pub status: SyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingMutation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRequest {
    pub entity_type: EntityType,
    /// Omitted for creates; a temporary id is assigned
    pub entity_id: Option<String>,
    pub kind: MutationKind,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResponse {
    pub entity_id: String,
    pub status: Option<SyncStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRequest {
    pub entity_type: EntityType,
    pub entity: ServerEntity,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub resolution: Resolution,
}

#[derive(Debug, Deserialize)]
pub struct ConnectivityRequest {
    pub online: bool,
}

/// Statuses of every tracked entity
async fn get_all_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let engine = state.engine();
    let status = engine.status();

    Json(StatusResponse {
        statuses: status.all(),
        errors: status.errors(),
        conflicts: status.conflicted(),
        pending: engine.queue().len().await,
        progress: status.progress(),
        connectivity: engine.monitor().state(),
    })
}

/// Status of one entity; temporary ids follow their rename
async fn get_entity_status(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
) -> Result<Json<EntityStatusResponse>> {
    let engine = state.engine();
    let entity_id = engine
        .status()
        .resolve_alias(&entity_id)
        .unwrap_or(entity_id);

    let status = engine
        .status()
        .get(&entity_id)
        .ok_or_else(|| AppError::NotFound(format!("Entity {} is not tracked", entity_id)))?;

    Ok(Json(EntityStatusResponse {
        error: engine.status().error(&entity_id),
        pending: engine.queue().get(&entity_id).await,
        entity_id,
        status,
    }))
}

/// Queue a local edit
async fn enqueue_mutation(
    State(state): State<AppState>,
    Json(req): Json<MutationRequest>,
) -> Result<(StatusCode, Json<MutationResponse>)> {
    let engine = state.engine();

    let entity_id = match (req.entity_id, req.kind) {
        (Some(id), _) => id,
        (None, MutationKind::Create) => TempId::generate(),
        (None, _) => {
            return Err(AppError::BadRequest(
                "entityId is required for updates and deletes".to_string(),
            ))
        }
    };

    engine
        .enqueue(req.entity_type, &entity_id, req.kind, req.payload)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(MutationResponse {
            status: engine.status().get(&entity_id),
            entity_id,
        }),
    ))
}

/// Record an entity fetched from the backend as the local base
async fn record_snapshot(
    State(state): State<AppState>,
    Json(req): Json<SnapshotRequest>,
) -> Result<StatusCode> {
    state.engine().track(req.entity_type, &req.entity).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Run a drain pass and report what it did
///
/// A request landing while a drain is in flight is folded into that drain
/// and answered with an empty report.
async fn trigger_sync(State(state): State<AppState>) -> Result<Json<DrainReport>> {
    let report = state.engine().sync_now().await?;
    Ok(Json(report))
}

async fn get_conflict(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
) -> Result<Json<ConflictDetails>> {
    state
        .engine()
        .get_conflict(&entity_id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No conflict for {}", entity_id)))
}

async fn resolve_conflict(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<MutationResponse>> {
    let engine = state.engine();
    engine.resolve_conflict(&entity_id, req.resolution).await?;

    Ok(Json(MutationResponse {
        status: engine.status().get(&entity_id),
        entity_id,
    }))
}

/// Feed platform reachability into the monitor
async fn report_connectivity(
    State(state): State<AppState>,
    Json(req): Json<ConnectivityRequest>,
) -> Json<ConnectivityState> {
    let monitor = state.engine().monitor();
    monitor.report(req.online);
    Json(monitor.state())
}
