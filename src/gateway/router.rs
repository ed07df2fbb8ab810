//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;
use subtle::ConstantTimeEq;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use super::auth::auth_middleware;
use crate::Error;
use crate::auth::Principal;
use crate::layer::ResilienceLayer;

/// Shared application state
pub struct AppState {
    /// Resilience registry
    pub layer: Arc<ResilienceLayer>,
    /// Resolved admin token; admin routes are refused when `None`
    pub admin_token: Option<String>,
    /// Prometheus render handle
    #[cfg(feature = "metrics")]
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl AppState {
    /// State with no metrics handle
    pub fn new(layer: Arc<ResilienceLayer>, admin_token: Option<String>) -> Self {
        Self {
            layer,
            admin_token,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let request_timeout = state.layer.config().server.request_timeout;

    let protected = Router::new()
        .route("/v1/whoami", get(whoami_handler))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), auth_middleware));

    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/health/ready", get(health_handler))
        .route("/health/live", get(live_handler))
        .route("/admin/circuits", get(list_circuits_handler))
        .route("/admin/circuits/{name}/reset", post(reset_circuit_handler))
        .merge(protected);

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(metrics_handler));

    router
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Readiness: runs every probe; 503 only when a critical dependency is down
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.layer.health().snapshot().await;
    let code = if snapshot.overall.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(snapshot))
}

/// Liveness: never touches a dependency
async fn live_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.layer.health().liveness())
}

async fn list_circuits_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Err(denied) = check_admin(&state, &headers) {
        return denied;
    }
    Json(state.layer.breakers().snapshots()).into_response()
}

async fn reset_circuit_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = check_admin(&state, &headers) {
        return denied;
    }

    match state.layer.breakers().reset(&name) {
        Ok(snapshot) => {
            info!(dependency = %name, "Circuit manually reset");
            Json(snapshot).into_response()
        }
        Err(Error::UnknownDependency(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Unknown dependency '{name}'") })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Echo the principal resolved by the auth middleware
async fn whoami_handler(principal: Option<Extension<Principal>>) -> impl IntoResponse {
    match principal {
        Some(Extension(principal)) => Json(json!({ "principal": principal })),
        None => Json(json!({ "principal": null, "auth": "disabled" })),
    }
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// Constant-time bearer check against the admin token
fn check_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.admin_token.as_deref().filter(|t| !t.is_empty()) else {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "Admin endpoints disabled: no admin token configured" })),
        )
            .into_response());
    };

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();

    if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        warn!("Admin request with missing or invalid token");
        Err((
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer")],
            Json(json!({ "error": "Invalid admin token" })),
        )
            .into_response())
    }
}
