//! Authentication middleware
//!
//! Maps an [`AuthDecision`] onto the HTTP response:
//! - `401` with `WWW-Authenticate` for a missing or invalid credential
//! - `429` when the principal is over its rate limit
//! - `503` with `Retry-After` when no verdict could be reached and the
//!   failure policy refused admission
//!
//! Admitted requests carry the [`Principal`](crate::auth::Principal) as a
//! request extension.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use super::router::AppState;
use crate::auth::AuthDecision;

/// Authentication middleware
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(guard) = state.layer.auth() else {
        return next.run(request).await;
    };

    let path = request.uri().path().to_string();
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match guard.authorize(&path, authorization.as_deref()).await {
        AuthDecision::Public => next.run(request).await,
        AuthDecision::Admitted(principal) => {
            debug!(principal = %principal.id, degraded = principal.degraded, path = %path, "Authenticated request");
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        decision => rejection(&path, decision),
    }
}

/// Response for a request that may not proceed
fn rejection(path: &str, decision: AuthDecision) -> Response {
    match decision {
        AuthDecision::Missing => {
            warn!(path = %path, "Missing Authorization header");
            unauthorized_response("Missing Authorization header. Use: Authorization: Bearer <token>")
        }
        AuthDecision::Rejected => {
            warn!(path = %path, "Invalid credential");
            unauthorized_response("Invalid credential")
        }
        AuthDecision::RateLimited { principal } => {
            warn!(principal = %principal, path = %path, "Rate limit exceeded");
            (
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, "60".to_string())],
                Json(json!({
                    "error": format!("Rate limit exceeded for '{principal}'. Try again later.")
                })),
            )
                .into_response()
        }
        AuthDecision::Unavailable { retry_after } => {
            warn!(path = %path, retry_after_secs = retry_after.as_secs(), "Credential validation unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::RETRY_AFTER, retry_after.as_secs().max(1).to_string())],
                Json(json!({
                    "error": "Authentication temporarily unavailable"
                })),
            )
                .into_response()
        }
        AuthDecision::Public | AuthDecision::Admitted(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "unexpected admission").into_response()
        }
    }
}

fn unauthorized_response(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(json!({ "error": message })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_missing_maps_to_401_with_challenge() {
        let response = rejection("/v1/whoami", AuthDecision::Missing);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
    }

    #[test]
    fn test_rejected_maps_to_401() {
        let response = rejection("/v1/whoami", AuthDecision::Rejected);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_rate_limited_maps_to_429() {
        let response = rejection(
            "/v1/whoami",
            AuthDecision::RateLimited {
                principal: "svc-a".into(),
            },
        );
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");
    }

    #[test]
    fn test_unavailable_maps_to_503_with_retry_after() {
        let response = rejection(
            "/v1/whoami",
            AuthDecision::Unavailable {
                retry_after: Duration::from_secs(12),
            },
        );
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "12");
    }
}
