pub mod admin;
pub mod auth;
pub mod bind;

use axum::middleware;
use axum::routing::get;
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
///
/// Routes are split into **public** (no auth required), **bind-protected**
/// (gated behind the `/bind` bearer token), and **admin-protected** (gated
/// behind the separate admin-snapshot bearer token).
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/healthz", get(admin::healthz))
        .route("/v1/nodes/ws", get(crate::nodes::ws::node_ws));

    let bind_protected = Router::new()
        .route("/bind", axum::routing::post(bind::bind))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_api_token));

    let admin_protected = Router::new()
        .route("/v1/admin/snapshot", get(admin::snapshot))
        .route_layer(middleware::from_fn_with_state(state, auth::require_admin_token));

    public
        .merge(bind_protected)
        .merge(admin_protected)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
