//! External credential authority

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::Principal;
use crate::connection::ConnectionTarget;
use crate::resolver::Resolver;
use crate::{Error, Result};

/// The system of record for credentials
#[async_trait]
pub trait Authority: Send + Sync {
    /// `Ok(Some)` for a valid credential, `Ok(None)` for an invalid one,
    /// `Err` when no verdict could be reached
    async fn validate(&self, credential: &str) -> Result<Option<Principal>>;
}

/// Authority reached over HTTP
///
/// Sends `POST {base}{validate_path}` with the credential as a bearer token.
/// `200` carries the principal as JSON; `401`/`403` mean invalid.
#[derive(Debug, Clone)]
pub struct HttpAuthority {
    dependency: String,
    url: String,
    client: Client,
}

impl HttpAuthority {
    /// Build a client for `target`, resolving names through `resolver`
    pub fn new(
        dependency: &str,
        target: &ConnectionTarget,
        validate_path: &str,
        resolver: Option<Resolver>,
        timeout: Duration,
    ) -> Result<Self> {
        let base = target.connection_string();
        let path = if validate_path.starts_with('/') {
            validate_path.to_string()
        } else {
            format!("/{validate_path}")
        };
        let url = format!("{}{path}", base.trim_end_matches('/'));
        url::Url::parse(&url).map_err(|e| Error::Config(format!("{dependency}: invalid authority URL: {e}")))?;

        let mut builder = Client::builder().timeout(timeout);
        if let Some(resolver) = resolver {
            builder = builder.dns_resolver(Arc::new(resolver));
        }
        let client = builder
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create authority HTTP client: {e}")))?;

        Ok(Self {
            dependency: dependency.to_string(),
            url,
            client,
        })
    }

    /// Validation endpoint
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Authority for HttpAuthority {
    async fn validate(&self, credential: &str) -> Result<Option<Principal>> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(credential)
            .send()
            .await?;

        let status = response.status();
        debug!(dependency = %self.dependency, status = %status, "Authority responded");
        match status {
            StatusCode::OK => Ok(Some(response.json::<Principal>().await?)),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(None),
            other => Err(Error::dependency(
                &self.dependency,
                format!("authority returned {other}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DependencyKind;
    use crate::connection::{ConnectionSpec, ConnectionStringBuilder};
    use axum::{Json, Router, http::HeaderMap, routing::post};
    use serde_json::json;

    async fn spawn_authority() -> std::net::SocketAddr {
        async fn validate(headers: HeaderMap) -> (StatusCode, Json<serde_json::Value>) {
            match headers.get("authorization").and_then(|v| v.to_str().ok()) {
                Some("Bearer good") => (
                    StatusCode::OK,
                    Json(json!({"principal_id": "svc-a", "scopes": ["read"], "rate_limit": 30})),
                ),
                Some("Bearer broken") => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({}))),
                _ => (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid"}))),
            }
        }

        let app = Router::new().route("/v1/validate", post(validate));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn authority(addr: std::net::SocketAddr) -> HttpAuthority {
        let target = ConnectionStringBuilder::build(&ConnectionSpec {
            kind: DependencyKind::Http,
            connection_string: Some(addr.to_string()),
            ..Default::default()
        })
        .unwrap();
        HttpAuthority::new("authority", &target, "v1/validate", None, Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_valid_credential() {
        let authority = authority(spawn_authority().await);
        assert!(authority.url().ends_with("/v1/validate"));

        let principal = authority.validate("good").await.unwrap().unwrap();
        assert_eq!(principal.id, "svc-a");
        assert_eq!(principal.rate_limit, 30);
    }

    #[tokio::test]
    async fn test_invalid_credential_is_a_verdict() {
        let authority = authority(spawn_authority().await);
        assert_eq!(authority.validate("bad").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_server_error_is_a_failure() {
        let authority = authority(spawn_authority().await);
        let err = authority.validate("broken").await.unwrap_err();
        assert!(err.is_dependency_failure());
    }

    #[tokio::test]
    async fn test_unreachable_is_a_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = authority(addr).validate("good").await.unwrap_err();
        assert!(err.is_dependency_failure());
    }
}
