//! Cached credential validation
//!
//! [`CachedAuthValidator`] answers "who is this credential?" with one of
//! three outcomes: a [`Principal`], [`Error::Unauthorized`](crate::Error::Unauthorized)
//! or [`Error::ValidatorUnavailable`](crate::Error::ValidatorUnavailable).
//! The last one is never turned into a grant here; [`AuthGuard`] applies the
//! operator's [`FailurePolicy`].

mod authority;
mod cache;
mod guard;
mod policy;
mod validator;

pub use authority::{Authority, HttpAuthority};
#[cfg(feature = "redis-cache")]
pub use cache::RedisAuthCache;
pub use cache::{AuthCache, AuthCacheStats, MemoryAuthCache};
pub use guard::{AuthDecision, AuthGuard};
pub use policy::{FailurePolicy, PolicyDecision};
pub use validator::{CachedAuthValidator, ValidatorSettings};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::humantime_serde;

/// An authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable identifier
    #[serde(alias = "principal_id")]
    pub id: String,
    /// Granted scopes
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Requests per minute (0 = unlimited)
    #[serde(default)]
    pub rate_limit: u32,
    /// Admitted without a verdict under a fail-open policy
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

impl Principal {
    /// Placeholder principal for fail-open admission: no scopes, flagged degraded
    #[must_use]
    pub fn unverified(fingerprint: &str) -> Self {
        let short = fingerprint.get(..12).unwrap_or(fingerprint);
        Self {
            id: format!("unverified:{short}"),
            scopes: Vec::new(),
            rate_limit: 0,
            degraded: true,
        }
    }

    /// Whether the principal holds `scope`
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

/// One-way fingerprint of a raw credential (SHA-256, hex)
#[must_use]
pub fn fingerprint(credential: &str) -> String {
    hex::encode(Sha256::digest(credential.as_bytes()))
}

/// A cached validation result, keyed by credential fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthCacheEntry {
    /// SHA-256 fingerprint of the credential
    pub credential_fingerprint: String,
    /// Principal identifier
    pub principal_id: String,
    /// Granted scopes
    pub scopes: Vec<String>,
    /// Requests per minute (0 = unlimited)
    pub rate_limit: u32,
    /// When the authority produced this result
    pub cached_at: DateTime<Utc>,
    /// How long the result may be served
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl AuthCacheEntry {
    /// Build an entry for a freshly validated principal
    #[must_use]
    pub fn new(credential_fingerprint: String, principal: &Principal, ttl: Duration) -> Self {
        Self {
            credential_fingerprint,
            principal_id: principal.id.clone(),
            scopes: principal.scopes.clone(),
            rate_limit: principal.rate_limit,
            cached_at: Utc::now(),
            ttl,
        }
    }

    /// Whether the TTL has elapsed (checked at read time)
    #[must_use]
    pub fn is_expired(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.cached_at);
        age.to_std().is_ok_and(|age| age >= self.ttl)
    }

    /// The principal this entry vouches for
    #[must_use]
    pub fn principal(&self) -> Principal {
        Principal {
            id: self.principal_id.clone(),
            scopes: self.scopes.clone(),
            rate_limit: self.rate_limit,
            degraded: false,
        }
    }
}
