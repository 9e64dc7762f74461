//! Axum router and handlers.
//!
//! Read-only: snapshots are written by the reducer alone. Middleware is
//! attached in `main.rs` so tests can drive the bare router.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tracing::warn;

use crate::{
    api_types::{ErrorResponse, HealthResponse},
    state::{uptime_secs, AppState},
};

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/state", get(latest_state))
        .with_state(state)
}

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service.to_string(),
            version: st.build.version.to_string(),
            uptime_secs: uptime_secs(),
        }),
    )
}

/// Latest persisted snapshot, 404 before the first one.
pub(crate) async fn latest_state(State(st): State<Arc<AppState>>) -> Response {
    match st.store.latest().await {
        Ok(Some(snapshot)) => (StatusCode::OK, Json(snapshot)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(ErrorResponse::new("NO_STATE"))).into_response(),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "GET /v1/state: store read failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse::new("STATE_STORE_UNAVAILABLE")),
            )
                .into_response()
        }
    }
}
