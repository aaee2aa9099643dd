use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::controller::ClusterStatus;
use crate::resources::ResourceList;
use crate::server::state::OperatorState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub clusters: usize,
    pub uptime_secs: i64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Health check endpoint
pub async fn health(State(state): State<OperatorState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        clusters: state.operator.len(),
        uptime_secs: state.uptime_secs(),
    })
}

/// Kind of the list served by `/v1/clusters`
pub const CLUSTER_STATUS_LIST_KIND: &str = "NatsClusterStatusList";

/// Status of every managed cluster
pub async fn list_clusters(State(state): State<OperatorState>) -> impl IntoResponse {
    let statuses: Vec<ClusterStatus> = state.operator.statuses().await;
    Json(ResourceList::new(CLUSTER_STATUS_LIST_KIND, statuses))
}

/// Status of one cluster
pub async fn get_cluster(
    State(state): State<OperatorState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.operator.status(&namespace, &name).await {
        Some(status) => (StatusCode::OK, Json(status)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("Cluster '{}/{}' not found", namespace, name),
            }),
        )
            .into_response(),
    }
}

/// Create the Axum router
pub fn create_router(state: OperatorState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/clusters", get(list_clusters))
        .route(
            "/v1/namespaces/{namespace}/clusters/{name}",
            get(get_cluster),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
