//! Cache-first credential validation

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::{AuthCache, AuthCacheEntry, Authority, Principal, fingerprint};
use crate::config::AuthConfig;
use crate::failsafe::{CircuitBreaker, with_deadline};
use crate::singleflight::SingleFlight;
use crate::telemetry;
use crate::{Error, Result};

/// Timeouts and TTL for the validation path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorSettings {
    /// How long a validated principal is cached
    pub cache_ttl: Duration,
    /// Deadline for each cache read or write
    pub cache_timeout: Duration,
    /// Deadline for the authority call
    pub authority_timeout: Duration,
}

impl From<&AuthConfig> for ValidatorSettings {
    fn from(config: &AuthConfig) -> Self {
        Self {
            cache_ttl: config.cache_ttl,
            cache_timeout: config.cache_timeout,
            authority_timeout: config.authority_timeout,
        }
    }
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self::from(&AuthConfig::default())
    }
}

/// Outcome shared between callers of one flight
#[derive(Debug, Clone)]
enum Verdict {
    Granted(Principal),
    Denied,
    Unavailable(String),
}

/// Validates credentials against an [`Authority`] behind an [`AuthCache`]
///
/// The authority is only ever called through its circuit breaker. A cache
/// that is slow or down degrades to a miss and never fails a request.
pub struct CachedAuthValidator {
    cache: Arc<dyn AuthCache>,
    authority: Arc<dyn Authority>,
    breaker: Arc<CircuitBreaker>,
    settings: ValidatorSettings,
    flights: SingleFlight<String, Verdict>,
}

impl CachedAuthValidator {
    /// Create a validator
    pub fn new(
        cache: Arc<dyn AuthCache>,
        authority: Arc<dyn Authority>,
        breaker: Arc<CircuitBreaker>,
        settings: ValidatorSettings,
    ) -> Self {
        Self {
            cache,
            authority,
            breaker,
            settings,
            flights: SingleFlight::new(),
        }
    }

    /// The breaker guarding the authority
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The cache in front of the authority
    #[must_use]
    pub fn cache(&self) -> &Arc<dyn AuthCache> {
        &self.cache
    }

    /// Validate a credential
    ///
    /// Returns the principal, [`Error::Unauthorized`] for an invalid or empty
    /// credential, or [`Error::ValidatorUnavailable`] when neither the cache
    /// nor the authority could produce a verdict.
    pub async fn validate(&self, credential: &str) -> Result<Principal> {
        if credential.trim().is_empty() {
            return Err(Error::Unauthorized);
        }

        let fp = fingerprint(credential);
        if let Some(principal) = self.cached(&fp).await {
            telemetry::record_validation("cache_hit");
            return Ok(principal);
        }

        let credential = credential.to_string();
        let verdict = self
            .flights
            .run(fp.clone(), || self.revalidate(fp.clone(), credential))
            .await
            .map_or_else(|e| Verdict::Unavailable(e.to_string()), |(verdict, _)| verdict);

        match verdict {
            Verdict::Granted(principal) => {
                telemetry::record_validation("granted");
                Ok(principal)
            }
            Verdict::Denied => {
                telemetry::record_validation("denied");
                Err(Error::Unauthorized)
            }
            Verdict::Unavailable(reason) => {
                telemetry::record_validation("unavailable");
                Err(Error::ValidatorUnavailable(reason))
            }
        }
    }

    /// Suggested wait before retrying after an unavailable verdict
    #[must_use]
    pub fn retry_after(&self) -> Duration {
        self.breaker
            .snapshot()
            .retry_in_ms
            .map_or(Duration::from_secs(5), |ms| Duration::from_millis(ms).max(Duration::from_secs(1)))
    }

    async fn cached(&self, fp: &str) -> Option<Principal> {
        match with_deadline("auth cache get", self.settings.cache_timeout, self.cache.get(fp)).await {
            Ok(Some(entry)) if !entry.is_expired() => {
                telemetry::record_auth_cache("hit");
                debug!(principal = %entry.principal_id, "Auth cache hit");
                Some(entry.principal())
            }
            Ok(_) => {
                telemetry::record_auth_cache("miss");
                None
            }
            Err(e) => {
                telemetry::record_auth_cache("error");
                warn!(cache = self.cache.backend(), error = %e, "Auth cache read failed, treating as miss");
                None
            }
        }
    }

    /// Flight body: authority call through the breaker, then cache write.
    /// Owns everything it touches so it can outlive the caller.
    fn revalidate(&self, fp: String, credential: String) -> impl Future<Output = Verdict> + Send + 'static {
        let cache = Arc::clone(&self.cache);
        let authority = Arc::clone(&self.authority);
        let breaker = Arc::clone(&self.breaker);
        let settings = self.settings;

        async move {
            let outcome = breaker
                .call(|| {
                    with_deadline(
                        "authority validate",
                        settings.authority_timeout,
                        authority.validate(&credential),
                    )
                })
                .await;

            match outcome {
                Ok(Some(principal)) => {
                    let entry = AuthCacheEntry::new(fp, &principal, settings.cache_ttl);
                    let write = with_deadline(
                        "auth cache set",
                        settings.cache_timeout,
                        cache.set(&entry, settings.cache_ttl),
                    );
                    if let Err(e) = write.await {
                        warn!(cache = cache.backend(), error = %e, "Auth cache write failed, continuing");
                    }
                    Verdict::Granted(principal)
                }
                Ok(None) => Verdict::Denied,
                Err(e) => {
                    warn!(dependency = %breaker.name(), error = %e, "Credential validation unavailable");
                    Verdict::Unavailable(e.to_string())
                }
            }
        }
    }
}
