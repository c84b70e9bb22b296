//! Admin HTTP Dispatcher
//!
//! One axum router over the capability providers. The dispatcher does
//! no business logic: it deserializes, delegates and maps errors onto
//! status codes. Membership failures serialize their per-node failure
//! list so operators get the whole story in one response.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::cluster_membership::ClusterMembershipHandler;
use crate::error::AdminError;
use crate::net_debug::{GetConnectionsDebugResponse, NetDebugHandle};
use crate::settings_override::SettingsHandler;
use crate::snapshot::SnapshotHandler;
use crate::types::*;

#[derive(Clone)]
pub struct AdminState {
    pub cluster: Arc<ClusterMembershipHandler>,
    pub settings: Arc<SettingsHandler>,
    pub snapshots: Arc<SnapshotHandler>,
    pub net_debug: Arc<NetDebugHandle>,
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdminError::OperationFailed(_) | AdminError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            AdminError::NodesConfigurationManager { .. } => StatusCode::BAD_REQUEST,
            AdminError::AlreadyBootstrapped => StatusCode::CONFLICT,
            AdminError::StaleVersion { .. } => StatusCode::CONFLICT,
            AdminError::NodeNotReady => StatusCode::SERVICE_UNAVAILABLE,
            AdminError::NotFound(_) => StatusCode::NOT_FOUND,
            AdminError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match &self {
            AdminError::OperationFailed(failed) => json!({
                "error": self.to_string(),
                "status": self.status().name(),
                "failed_nodes": failed.failed_nodes,
            }),
            _ => json!({
                "error": self.to_string(),
                "status": self.status().name(),
            }),
        };
        (status, Json(body)).into_response()
    }
}

/// Build the admin router over the capability providers.
pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/v1/cluster-membership/add-nodes", post(add_nodes))
        .route("/v1/cluster-membership/update-nodes", post(update_nodes))
        .route("/v1/cluster-membership/remove-nodes", post(remove_nodes))
        .route(
            "/v1/cluster-membership/mark-shards-as-provisioned",
            post(mark_shards_as_provisioned),
        )
        .route(
            "/v1/cluster-membership/bump-node-generation",
            post(bump_node_generation),
        )
        .route("/v1/cluster-membership/bootstrap", post(bootstrap_cluster))
        .route("/v1/nodes/config", post(get_nodes_config))
        .route("/v1/nodes/state", post(get_nodes_state))
        .route("/v1/debug/connections", get(get_connections_debug))
        .route("/v1/settings", get(get_settings).post(get_settings_filtered))
        .route("/v1/settings/apply-override", post(apply_setting_override))
        .route("/v1/settings/remove-override", post(remove_setting_override))
        .route("/v1/snapshots/log-tree", post(take_log_tree_snapshot))
        .route(
            "/v1/snapshots/maintenance-log",
            post(take_maintenance_log_snapshot),
        )
        .with_state(state)
}

async fn add_nodes(
    State(state): State<AdminState>,
    Json(request): Json<AddNodesRequest>,
) -> Result<Json<AddNodesResponse>, AdminError> {
    state.cluster.add_nodes(request).await.map(Json)
}

async fn update_nodes(
    State(state): State<AdminState>,
    Json(request): Json<UpdateNodesRequest>,
) -> Result<Json<UpdateNodesResponse>, AdminError> {
    state.cluster.update_nodes(request).await.map(Json)
}

async fn remove_nodes(
    State(state): State<AdminState>,
    Json(request): Json<RemoveNodesRequest>,
) -> Result<Json<RemoveNodesResponse>, AdminError> {
    state.cluster.remove_nodes(request).await.map(Json)
}

async fn mark_shards_as_provisioned(
    State(state): State<AdminState>,
    Json(request): Json<MarkShardsAsProvisionedRequest>,
) -> Result<Json<MarkShardsAsProvisionedResponse>, AdminError> {
    state
        .cluster
        .mark_shards_as_provisioned(request)
        .await
        .map(Json)
}

async fn bump_node_generation(
    State(state): State<AdminState>,
    Json(request): Json<BumpGenerationRequest>,
) -> Result<Json<BumpGenerationResponse>, AdminError> {
    state.cluster.bump_node_generation(request).await.map(Json)
}

async fn bootstrap_cluster(
    State(state): State<AdminState>,
    Json(request): Json<BootstrapClusterRequest>,
) -> Result<Json<BootstrapClusterResponse>, AdminError> {
    state.cluster.bootstrap_cluster(request).await.map(Json)
}

async fn get_nodes_config(
    State(state): State<AdminState>,
    Json(request): Json<GetNodesConfigRequest>,
) -> Json<GetNodesConfigResponse> {
    Json(state.cluster.get_nodes_config(&request.filter))
}

async fn get_nodes_state(
    State(state): State<AdminState>,
    Json(request): Json<GetNodesConfigRequest>,
) -> Json<GetNodesStateResponse> {
    Json(state.cluster.get_nodes_state(&request.filter))
}

async fn get_connections_debug(
    State(state): State<AdminState>,
) -> Json<GetConnectionsDebugResponse> {
    Json(GetConnectionsDebugResponse {
        workers: state.net_debug.connections().await,
    })
}

async fn get_settings(State(state): State<AdminState>) -> Json<GetSettingsResponse> {
    Json(state.settings.get_settings(&[]))
}

async fn get_settings_filtered(
    State(state): State<AdminState>,
    Json(request): Json<GetSettingsRequest>,
) -> Json<GetSettingsResponse> {
    Json(state.settings.get_settings(&request.settings))
}

async fn apply_setting_override(
    State(state): State<AdminState>,
    Json(request): Json<ApplySettingOverrideRequest>,
) -> Result<StatusCode, AdminError> {
    state
        .settings
        .apply_setting_override(&request.name, &request.value, request.ttl_seconds)?;
    Ok(StatusCode::OK)
}

async fn remove_setting_override(
    State(state): State<AdminState>,
    Json(request): Json<RemoveSettingOverrideRequest>,
) -> StatusCode {
    state.settings.remove_setting_override(&request.name);
    StatusCode::OK
}

async fn take_log_tree_snapshot(
    State(state): State<AdminState>,
    Json(request): Json<TakeSnapshotRequest>,
) -> Result<StatusCode, AdminError> {
    state.snapshots.take_log_tree_snapshot(request.min_version)?;
    Ok(StatusCode::OK)
}

async fn take_maintenance_log_snapshot(
    State(state): State<AdminState>,
    Json(request): Json<TakeSnapshotRequest>,
) -> Result<StatusCode, AdminError> {
    state
        .snapshots
        .take_maintenance_log_snapshot(request.min_version)?;
    Ok(StatusCode::OK)
}
