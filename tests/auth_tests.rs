//! End-to-end credential validation
//!
//! Runs a real HTTP authority on a loopback port and drives the cached
//! validator and the request guard through it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use depguard::Error;
use depguard::auth::{AuthDecision, AuthGuard, CachedAuthValidator, HttpAuthority, MemoryAuthCache, ValidatorSettings};
use depguard::config::{AuthConfig, CircuitBreakerConfig, DependencyKind, FailurePolicyKind};
use depguard::connection::{ConnectionSpec, ConnectionStringBuilder};
use depguard::failsafe::{CircuitBreaker, CircuitState};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

/// Authority stub: `good` and `limited` are valid, everything else is not
async fn spawn_authority(hits: Arc<AtomicUsize>) -> SocketAddr {
    async fn validate(State(hits): State<Arc<AtomicUsize>>, headers: HeaderMap) -> (StatusCode, Json<Value>) {
        hits.fetch_add(1, Ordering::SeqCst);
        match headers.get("authorization").and_then(|v| v.to_str().ok()) {
            Some("Bearer good") => (
                StatusCode::OK,
                Json(json!({"principal_id": "svc-orders", "scopes": ["orders:read"]})),
            ),
            Some("Bearer limited") => (
                StatusCode::OK,
                Json(json!({"principal_id": "svc-batch", "rate_limit": 1})),
            ),
            _ => (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid credential"}))),
        }
    }

    let app = Router::new().route("/v1/validate", post(validate)).with_state(hits);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// An address nothing listens on
fn dead_address() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn validator(addr: SocketAddr, failure_threshold: u32) -> Arc<CachedAuthValidator> {
    let target = ConnectionStringBuilder::build(&ConnectionSpec {
        kind: DependencyKind::Http,
        connection_string: Some(addr.to_string()),
        ..Default::default()
    })
    .unwrap();
    let settings = ValidatorSettings {
        cache_ttl: Duration::from_secs(60),
        cache_timeout: Duration::from_millis(100),
        authority_timeout: Duration::from_secs(1),
    };
    let authority = HttpAuthority::new("authority", &target, "/v1/validate", None, settings.authority_timeout).unwrap();
    let breaker = CircuitBreaker::new(
        "authority",
        &CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout: Duration::from_secs(30),
            ..Default::default()
        },
    );

    Arc::new(CachedAuthValidator::new(
        Arc::new(MemoryAuthCache::new()),
        Arc::new(authority),
        Arc::new(breaker),
        settings,
    ))
}

fn guard(validator: Arc<CachedAuthValidator>, policy: FailurePolicyKind, grace_window: Duration) -> AuthGuard {
    AuthGuard::new(
        validator,
        &AuthConfig {
            enabled: true,
            failure_policy: policy,
            grace_window,
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_valid_credential_is_cached_for_ttl() {
    let hits = Arc::new(AtomicUsize::new(0));
    let validator = validator(spawn_authority(hits.clone()).await, 5);

    let first = validator.validate("good").await.unwrap();
    assert_eq!(first.id, "svc-orders");
    assert!(first.has_scope("orders:read"));
    assert!(!first.degraded);

    let second = validator.validate("good").await.unwrap();
    assert_eq!(second, first);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalid_credential_is_unauthorized_and_not_a_failure() {
    let hits = Arc::new(AtomicUsize::new(0));
    let validator = validator(spawn_authority(hits.clone()).await, 1);

    for _ in 0..3 {
        assert!(matches!(validator.validate("forged").await, Err(Error::Unauthorized)));
    }
    // Denials are not cached and never trip the breaker
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(validator.breaker().state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_empty_credential_never_reaches_authority() {
    let hits = Arc::new(AtomicUsize::new(0));
    let validator = validator(spawn_authority(hits.clone()).await, 5);

    assert!(matches!(validator.validate("   ").await, Err(Error::Unauthorized)));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unreachable_authority_with_empty_cache_is_unavailable() {
    let validator = validator(dead_address(), 5);

    match validator.validate("good").await {
        Err(Error::ValidatorUnavailable(_)) => {}
        other => panic!("expected ValidatorUnavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn test_repeated_outage_opens_authority_circuit() {
    let validator = validator(dead_address(), 2);

    for _ in 0..2 {
        assert!(matches!(
            validator.validate("good").await,
            Err(Error::ValidatorUnavailable(_))
        ));
    }
    assert_eq!(validator.breaker().state(), CircuitState::Open);

    // Rejected by the breaker, still reported as unavailable
    assert!(matches!(
        validator.validate("good").await,
        Err(Error::ValidatorUnavailable(_))
    ));
    assert!(validator.retry_after() >= Duration::from_secs(1));
}

#[tokio::test]
async fn test_fail_closed_refuses_during_outage() {
    let guard = guard(validator(dead_address(), 5), FailurePolicyKind::FailClosed, Duration::from_secs(60));

    let decision = guard.authorize("/v1/whoami", Some("Bearer good")).await;
    assert!(matches!(decision, AuthDecision::Unavailable { .. }));
    assert!(guard.policy().in_outage());
}

#[tokio::test]
async fn test_fail_open_admits_unverified_within_grace_window() {
    let guard = guard(validator(dead_address(), 5), FailurePolicyKind::FailOpen, Duration::from_millis(50));

    match guard.authorize("/v1/whoami", Some("Bearer good")).await {
        AuthDecision::Admitted(principal) => {
            assert!(principal.degraded);
            assert!(principal.id.starts_with("unverified:"));
            assert!(principal.scopes.is_empty());
        }
        other => panic!("expected unverified admission, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(matches!(
        guard.authorize("/v1/whoami", Some("Bearer good")).await,
        AuthDecision::Unavailable { .. }
    ));
}

#[tokio::test]
async fn test_guard_decisions_against_live_authority() {
    let hits = Arc::new(AtomicUsize::new(0));
    let guard = guard(
        validator(spawn_authority(hits).await, 5),
        FailurePolicyKind::FailClosed,
        Duration::from_secs(60),
    );

    assert_eq!(guard.authorize("/health/ready", None).await, AuthDecision::Public);
    assert_eq!(guard.authorize("/v1/whoami", None).await, AuthDecision::Missing);
    assert_eq!(
        guard.authorize("/v1/whoami", Some("Basic Z29vZA==")).await,
        AuthDecision::Missing
    );
    assert_eq!(
        guard.authorize("/v1/whoami", Some("Bearer forged")).await,
        AuthDecision::Rejected
    );

    match guard.authorize("/v1/whoami", Some("Bearer good")).await {
        AuthDecision::Admitted(principal) => assert_eq!(principal.id, "svc-orders"),
        other => panic!("expected admission, got {other:?}"),
    }
    assert!(!guard.policy().in_outage());
}

#[tokio::test]
async fn test_principal_rate_limit_applies_after_validation() {
    let hits = Arc::new(AtomicUsize::new(0));
    let guard = guard(
        validator(spawn_authority(hits).await, 5),
        FailurePolicyKind::FailClosed,
        Duration::from_secs(60),
    );

    assert!(matches!(
        guard.authorize("/v1/whoami", Some("Bearer limited")).await,
        AuthDecision::Admitted(_)
    ));
    assert_eq!(
        guard.authorize("/v1/whoami", Some("Bearer limited")).await,
        AuthDecision::RateLimited {
            principal: "svc-batch".to_string()
        }
    );
}
