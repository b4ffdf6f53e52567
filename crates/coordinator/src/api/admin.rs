//! Read-only operator-facing endpoints: `/healthz` and the registry
//! snapshot used by dashboards external to this crate (§1 scope note:
//! the dashboard itself is out of scope, this is its only core-facing
//! collaborator).

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub connected_nodes: usize,
}

pub async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connected_nodes: state.registry.len(),
    })
}

pub async fn snapshot(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "sessions": state.registry.snapshot(),
    }))
}
