//! Failsafe mechanisms: circuit breakers, deadlines, rate limiting, call stats

mod circuit_breaker;
mod rate_limiter;
mod stats;

pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitSnapshot, CircuitState};
pub use rate_limiter::PrincipalRateLimiter;
pub use stats::{CallStats, CallStatsSnapshot};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use crate::config::{CircuitBreakerConfig, DependencyConfig};
use crate::{Error, Result};

/// Run `fut` under a deadline; expiry becomes [`Error::Timeout`]
pub async fn with_deadline<T, Fut>(operation: &str, after: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| Error::Timeout {
            operation: operation.to_string(),
            after,
        })?
}

/// One breaker per guarded dependency
#[derive(Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a breaker for every configured dependency
    #[must_use]
    pub fn from_dependencies(dependencies: &BTreeMap<String, DependencyConfig>) -> Self {
        let registry = Self::new();
        for (name, dep) in dependencies {
            registry.register(name, &dep.circuit_breaker);
        }
        registry
    }

    /// Get the breaker for `name`, creating it if absent
    pub fn register(&self, name: &str, config: &CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        Arc::clone(
            self.breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
                .value(),
        )
    }

    /// Breaker for `name`
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Breaker for `name`, or [`Error::UnknownDependency`]
    pub fn require(&self, name: &str) -> Result<Arc<CircuitBreaker>> {
        self.get(name)
            .ok_or_else(|| Error::UnknownDependency(name.to_string()))
    }

    /// Force a breaker closed
    pub fn reset(&self, name: &str) -> Result<CircuitSnapshot> {
        Ok(self.require(name)?.reset())
    }

    /// Snapshots of every breaker, sorted by name
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        snapshots
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.breakers.iter().map(|b| b.key().clone()).collect();
        names.sort();
        names
    }

    /// Apply a new dependency table: existing breakers keep their state,
    /// new dependencies get fresh breakers, removed ones are dropped
    pub fn reconfigure(&self, dependencies: &BTreeMap<String, DependencyConfig>) {
        for (name, dep) in dependencies {
            match self.get(name) {
                Some(breaker) => breaker.reconfigure(&dep.circuit_breaker),
                None => {
                    self.register(name, &dep.circuit_breaker);
                    info!(dependency = %name, "Circuit breaker added");
                }
            }
        }
        self.breakers.retain(|name, _| {
            let keep = dependencies.contains_key(name);
            if !keep {
                info!(dependency = %name, "Circuit breaker removed");
            }
            keep
        });
    }

    /// Number of registered breakers
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether no breaker is registered
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(names: &[&str]) -> BTreeMap<String, DependencyConfig> {
        names
            .iter()
            .map(|n| ((*n).to_string(), DependencyConfig::default()))
            .collect()
    }

    #[tokio::test]
    async fn test_with_deadline_expires() {
        let result: Result<()> = with_deadline("slow op", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout { ref operation, .. }) if operation == "slow op"));
    }

    #[tokio::test]
    async fn test_with_deadline_passes_result() {
        let value = with_deadline("fast op", Duration::from_secs(1), async { Ok(5) })
            .await
            .unwrap();
        assert_eq!(value, 5);
    }

    #[test]
    fn test_registry_lookup_and_reset() {
        let registry = BreakerRegistry::from_dependencies(&deps(&["cache", "tracking"]));
        assert_eq!(registry.names(), vec!["cache", "tracking"]);
        assert!(registry.get("cache").is_some());
        assert!(matches!(registry.reset("nope"), Err(Error::UnknownDependency(_))));
        assert_eq!(registry.reset("cache").unwrap().state, CircuitState::Closed);
    }

    #[test]
    fn test_register_returns_existing() {
        let registry = BreakerRegistry::new();
        let a = registry.register("cache", &CircuitBreakerConfig::default());
        let b = registry.register("cache", &CircuitBreakerConfig::default());
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_reconfigure_adds_and_removes() {
        let registry = BreakerRegistry::from_dependencies(&deps(&["cache", "tracking"]));
        let cache = registry.get("cache").unwrap();
        registry.reconfigure(&deps(&["cache", "broker"]));
        assert_eq!(registry.names(), vec!["broker", "cache"]);
        assert!(Arc::ptr_eq(&cache, &registry.get("cache").unwrap()));
    }
}
