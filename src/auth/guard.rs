//! Request-level authentication decisions

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{CachedAuthValidator, FailurePolicy, PolicyDecision, Principal, fingerprint};
use crate::Error;
use crate::config::AuthConfig;
use crate::failsafe::PrincipalRateLimiter;

/// Outcome of authenticating one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// Path bypasses authentication
    Public,
    /// Request may proceed as this principal
    Admitted(Principal),
    /// No bearer credential was presented
    Missing,
    /// The credential is invalid
    Rejected,
    /// The principal exceeded its rate limit
    RateLimited {
        /// Principal identifier
        principal: String,
    },
    /// No verdict and the policy refused admission
    Unavailable {
        /// Suggested wait before retrying
        retry_after: Duration,
    },
}

/// Validator plus failure policy, rate limits and public paths
pub struct AuthGuard {
    validator: Arc<CachedAuthValidator>,
    policy: FailurePolicy,
    limiter: PrincipalRateLimiter,
    public_paths: Vec<String>,
}

impl AuthGuard {
    /// Create a guard
    pub fn new(validator: Arc<CachedAuthValidator>, config: &AuthConfig) -> Self {
        Self {
            validator,
            policy: FailurePolicy::from(config),
            limiter: PrincipalRateLimiter::new(),
            public_paths: config.public_paths.clone(),
        }
    }

    /// The underlying validator
    #[must_use]
    pub fn validator(&self) -> &Arc<CachedAuthValidator> {
        &self.validator
    }

    /// The failure policy in force
    #[must_use]
    pub fn policy(&self) -> &FailurePolicy {
        &self.policy
    }

    /// Check if a path is public (bypasses auth)
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// Authenticate a request from its path and `Authorization` header
    pub async fn authorize(&self, path: &str, authorization: Option<&str>) -> AuthDecision {
        if self.is_public_path(path) {
            debug!(path = %path, "Public path, skipping auth");
            return AuthDecision::Public;
        }

        let Some(token) = authorization.and_then(bearer_token) else {
            return AuthDecision::Missing;
        };

        let principal = match self.validator.validate(token).await {
            Ok(principal) => {
                self.policy.on_verdict();
                principal
            }
            Err(Error::ValidatorUnavailable(reason)) => {
                match self.policy.on_unavailable(&fingerprint(token)) {
                    PolicyDecision::Admit(principal) => {
                        warn!(path = %path, principal = %principal.id, error = %reason, "Admitting unverified request");
                        principal
                    }
                    PolicyDecision::Reject => {
                        return AuthDecision::Unavailable {
                            retry_after: self.validator.retry_after(),
                        };
                    }
                }
            }
            Err(_) => {
                self.policy.on_verdict();
                return AuthDecision::Rejected;
            }
        };

        if !self.limiter.try_acquire(&principal.id, principal.rate_limit) {
            return AuthDecision::RateLimited {
                principal: principal.id,
            };
        }

        AuthDecision::Admitted(principal)
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
