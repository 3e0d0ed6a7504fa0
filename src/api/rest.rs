use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain::fleet_service::FleetService;
use crate::domain::monitoring::{Accident, AccidentQuery, Page, Ping, Stat};
use crate::domain::node::{NewNode, NodeView};
use crate::error::{FleetError, ProvisionError, StoreError};
use crate::mesh::{MeshReport, MeshStatus};
use crate::node_log::LogPage;

/// Shared application state for all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub fleet: Arc<FleetService>,
    pub controller: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub version: String,
    pub controller: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionAccepted {
    pub node_id: String,
    pub started: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResult {
    pub node_id: String,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteAccidents {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResult {
    pub deleted: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/nodes", get(list_nodes).post(add_node))
        .route("/api/v1/nodes/{id}", get(get_node).delete(remove_node))
        .route("/api/v1/nodes/{id}/provision", post(provision))
        .route("/api/v1/nodes/{id}/cancel", post(cancel))
        .route("/api/v1/nodes/{id}/retry-connection", post(retry_connection))
        .route("/api/v1/nodes/{id}/logs", get(node_logs))
        .route("/api/v1/nodes/{id}/stats", get(stats))
        .route("/api/v1/nodes/{id}/pings", get(pings))
        .route("/api/v1/accidents", get(accidents))
        .route("/api/v1/accidents/{id}", axum::routing::delete(delete_accident))
        .route("/api/v1/accidents/delete", post(delete_accidents))
        .route("/api/v1/mesh/sync", post(sync_mesh))
        .route("/api/v1/mesh/status", get(mesh_status))
        .with_state(state)
}

/// Map service errors to HTTP status codes.
fn error_response(err: FleetError) -> (StatusCode, String) {
    let status = match &err {
        FleetError::Store(StoreError::NotFound(_) | StoreError::AccidentNotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        FleetError::Store(StoreError::Invalid(_)) => StatusCode::BAD_REQUEST,
        FleetError::Store(StoreError::Conflict { .. }) => StatusCode::CONFLICT,
        FleetError::Provision(ProvisionError::AlreadyRunning(_) | ProvisionError::NotConnected(_)) => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        controller: state.controller.clone(),
    })
}

async fn list_nodes(
    State(state): State<AppState>,
) -> Result<Json<Vec<NodeView>>, (StatusCode, String)> {
    state.fleet.list_nodes().await.map(Json).map_err(error_response)
}

async fn add_node(
    State(state): State<AppState>,
    Json(req): Json<NewNode>,
) -> Result<(StatusCode, Json<NodeView>), (StatusCode, String)> {
    state
        .fleet
        .add_node(req)
        .await
        .map(|node| (StatusCode::CREATED, Json(node)))
        .map_err(error_response)
}

async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<NodeView>, (StatusCode, String)> {
    state.fleet.get_node(&id).await.map(Json).map_err(error_response)
}

async fn remove_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .fleet
        .remove_node(&id)
        .await
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(error_response)
}

/// Start provisioning in the background. Progress shows up in the node's
/// agent status and its log.
async fn provision(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<ProvisionAccepted>), (StatusCode, String)> {
    state
        .fleet
        .start_provisioning(&id)
        .await
        .map(|()| {
            (
                StatusCode::ACCEPTED,
                Json(ProvisionAccepted {
                    node_id: id,
                    started: true,
                }),
            )
        })
        .map_err(error_response)
}

async fn cancel(State(state): State<AppState>, Path(id): Path<String>) -> Json<CancelResult> {
    let cancelled = state.fleet.cancel_provisioning(&id);
    Json(CancelResult {
        node_id: id,
        cancelled,
    })
}

async fn retry_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<NodeView>, (StatusCode, String)> {
    state
        .fleet
        .retry_connection(&id)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn node_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<LogPage>, (StatusCode, String)> {
    state
        .fleet
        .node_logs(&id, params.page, params.page_size)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<Stat>>, (StatusCode, String)> {
    state
        .fleet
        .stats(&id, params.limit)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn pings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<Ping>>, (StatusCode, String)> {
    state
        .fleet
        .pings(&id, params.limit)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn accidents(
    State(state): State<AppState>,
    Query(query): Query<AccidentQuery>,
) -> Result<Json<Page<Accident>>, (StatusCode, String)> {
    state
        .fleet
        .accidents(&query)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn delete_accident(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .fleet
        .delete_accident(&id)
        .await
        .map(|()| StatusCode::NO_CONTENT)
        .map_err(error_response)
}

async fn delete_accidents(
    State(state): State<AppState>,
    Json(req): Json<DeleteAccidents>,
) -> Result<Json<DeleteResult>, (StatusCode, String)> {
    state
        .fleet
        .delete_accidents(&req.ids)
        .await
        .map(|deleted| Json(DeleteResult { deleted }))
        .map_err(error_response)
}

async fn sync_mesh(
    State(state): State<AppState>,
) -> Result<Json<MeshReport>, (StatusCode, String)> {
    state.fleet.sync_mesh().await.map(Json).map_err(error_response)
}

async fn mesh_status(State(state): State<AppState>) -> Json<MeshStatus> {
    Json(state.fleet.mesh_status().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (FleetError::from(StoreError::NotFound("n1".into())), StatusCode::NOT_FOUND),
            (
                FleetError::from(StoreError::AccidentNotFound("a1".into())),
                StatusCode::NOT_FOUND,
            ),
            (FleetError::from(StoreError::Invalid("name".into())), StatusCode::BAD_REQUEST),
            (
                FleetError::from(ProvisionError::AlreadyRunning("n1".into())),
                StatusCode::CONFLICT,
            ),
            (
                FleetError::from(ProvisionError::NotConnected("n1".into())),
                StatusCode::CONFLICT,
            ),
            (
                FleetError::from(StoreError::Persist("disk full".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(error_response(err).0, expected);
        }
    }
}
