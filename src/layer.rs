//! The process-wide resilience registry
//!
//! [`ResilienceLayer`] is built once at startup from a validated [`Config`]
//! and owns every piece of shared state: the resolver cache, the breaker
//! registry, the connection-target table, the auth guard and the health
//! aggregator. Components receive it (or parts of it) explicitly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::{
    AuthCache, AuthGuard, CachedAuthValidator, HttpAuthority, MemoryAuthCache, ValidatorSettings,
};
use crate::config::{AuthCacheKind, Config};
use crate::connection::ConnectionTarget;
use crate::failsafe::BreakerRegistry;
use crate::health::{BreakerProbe, CacheProbe, CompositeProbe, HealthAggregator, Probe, TcpProbe};
use crate::resolver::Resolver;
use crate::{Error, Result};

/// Upper bound between sweeps of the in-memory auth cache
const MAX_EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Shared resilience state
pub struct ResilienceLayer {
    config: RwLock<Arc<Config>>,
    resolver: Resolver,
    breakers: Arc<BreakerRegistry>,
    targets: RwLock<BTreeMap<String, ConnectionTarget>>,
    auth: RwLock<Option<AuthStack>>,
    memory_cache: Option<Arc<MemoryAuthCache>>,
    health: Arc<HealthAggregator>,
}

impl ResilienceLayer {
    /// Build the layer from configuration
    ///
    /// # Errors
    ///
    /// Any [`Error::Config`] here is fatal: the process must not start with
    /// a dependency it cannot address.
    pub fn init(config: Config) -> Result<Self> {
        config.validate()?;

        let targets = config.connection_targets()?;
        let resolver = Resolver::from_config(&config.resolver)?;
        let breakers = Arc::new(BreakerRegistry::from_dependencies(&config.dependencies));

        for (name, target) in &targets {
            info!(
                dependency = %name,
                kind = %config.dependencies[name].kind,
                target = %target.redacted(),
                tls = target.tls_enabled,
                "Registered dependency"
            );
        }

        let (auth, memory_cache) = if config.auth.enabled {
            let (cache, memory) = build_auth_cache(&config, &targets)?;
            let authority = build_authority(&config, &targets, &resolver)?;
            info!(
                authority = %authority.url(),
                cache = cache.backend(),
                policy = ?config.auth.failure_policy,
                "Auth validation enabled"
            );
            let stack = AuthStack::assemble(&config, cache, authority, &breakers);
            (Some(stack), memory)
        } else {
            warn!("Auth validation disabled");
            (None, None)
        };

        let health = Arc::new(HealthAggregator::new(config.health.probe_timeout));
        health.replace_probes(build_probes(
            &config,
            &targets,
            &breakers,
            &resolver,
            auth.as_ref().map(|stack| &stack.cache),
        ));

        Ok(Self {
            config: RwLock::new(Arc::new(config)),
            resolver,
            breakers,
            targets: RwLock::new(targets),
            auth: RwLock::new(auth),
            memory_cache,
            health,
        })
    }

    /// Current configuration
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read())
    }

    /// Shared resolver
    #[must_use]
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Breaker registry
    #[must_use]
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Auth guard, when auth is enabled
    pub fn auth(&self) -> Option<Arc<AuthGuard>> {
        self.auth.read().as_ref().map(|stack| Arc::clone(&stack.guard))
    }

    /// Health aggregator
    #[must_use]
    pub fn health(&self) -> &Arc<HealthAggregator> {
        &self.health
    }

    /// Connection target of a dependency
    pub fn target(&self, name: &str) -> Option<ConnectionTarget> {
        self.targets.read().get(name).cloned()
    }

    /// All connection targets
    pub fn targets(&self) -> BTreeMap<String, ConnectionTarget> {
        self.targets.read().clone()
    }

    /// Apply a reloaded configuration
    ///
    /// Breaker thresholds, the connection-target table and health probes are
    /// swapped in place. Breaker state survives for dependencies that remain.
    /// When the authority or auth cache target moves, or auth settings
    /// change, the auth stack is rebuilt around the same breaker. Server
    /// address, resolver, auth on/off and cache backend changes need a
    /// restart.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] and changes nothing when `new` is invalid.
    pub fn apply_reload(&self, new: Config) -> Result<()> {
        new.validate()?;
        let targets = new.connection_targets()?;

        let current = self.config();
        if current.server.host != new.server.host || current.server.port != new.server.port {
            warn!("Config reload: server address changed, restart required to apply");
        }
        if current.resolver != new.resolver {
            warn!("Config reload: resolver settings changed, restart required to apply");
        }
        let pending = self.prepare_auth(&current, &new, &targets)?;

        self.breakers.reconfigure(&new.dependencies);
        if let Some((cache, authority)) = pending {
            info!(authority = %authority.url(), cache = cache.backend(), "Config reload: auth stack rebuilt");
            let stack = AuthStack::assemble(&new, cache, authority, &self.breakers);
            *self.auth.write() = Some(stack);
        }
        let auth_cache = self.auth.read().as_ref().map(|stack| Arc::clone(&stack.cache));
        self.health.replace_probes(build_probes(
            &new,
            &targets,
            &self.breakers,
            &self.resolver,
            auth_cache.as_ref(),
        ));
        *self.targets.write() = targets;
        *self.config.write() = Arc::new(new);

        info!(dependencies = self.breakers.len(), "Config reload applied");
        Ok(())
    }

    /// Build the clients a reload needs before anything is swapped.
    /// `None` keeps the running auth stack.
    fn prepare_auth(
        &self,
        current: &Config,
        new: &Config,
        targets: &BTreeMap<String, ConnectionTarget>,
    ) -> Result<Option<(Arc<dyn AuthCache>, HttpAuthority)>> {
        let Some(running_cache) = self.auth.read().as_ref().map(|stack| Arc::clone(&stack.cache)) else {
            if new.auth.enabled {
                warn!("Config reload: auth enabled, restart required to apply");
            }
            return Ok(None);
        };
        if !new.auth.enabled {
            warn!("Config reload: auth disabled, restart required to apply");
            return Ok(None);
        }

        let old_targets = self.targets.read();
        let authority_moved =
            old_targets.get(&current.auth.authority) != targets.get(&new.auth.authority);
        let cache_moved = new.auth.cache == AuthCacheKind::Redis
            && old_targets.get(&current.auth.cache_dependency) != targets.get(&new.auth.cache_dependency);
        drop(old_targets);

        let backend_changed = current.auth.cache != new.auth.cache;
        if backend_changed {
            warn!("Config reload: auth cache backend changed, restart required to apply");
        }
        if !authority_moved && !cache_moved && current.auth == new.auth {
            return Ok(None);
        }

        let cache = if cache_moved && !backend_changed {
            build_auth_cache(new, targets)?.0
        } else {
            running_cache
        };
        Ok(Some((cache, build_authority(new, targets, &self.resolver)?)))
    }

    /// Start the health poll loop and cache eviction; both stop on `shutdown`
    pub fn spawn_background(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let config = self.config();
        let mut handles = vec![
            self.health
                .spawn_poll(config.health.poll_interval, shutdown.subscribe()),
        ];

        if let Some(cache) = &self.memory_cache {
            let interval = config.auth.cache_ttl.min(MAX_EVICTION_INTERVAL).max(Duration::from_secs(1));
            handles.push(cache.spawn_eviction(interval, shutdown.subscribe()));
        }

        debug!(tasks = handles.len(), "Background tasks started");
        handles
    }
}

/// The live auth guard and the cache it reads
struct AuthStack {
    guard: Arc<AuthGuard>,
    cache: Arc<dyn AuthCache>,
}

impl AuthStack {
    fn assemble(
        config: &Config,
        cache: Arc<dyn AuthCache>,
        authority: HttpAuthority,
        breakers: &BreakerRegistry,
    ) -> Self {
        let name = &config.auth.authority;
        let breaker_config = config
            .dependencies
            .get(name)
            .map(|dep| dep.circuit_breaker.clone())
            .unwrap_or_default();
        let breaker = breakers.register(name, &breaker_config);
        let validator = Arc::new(CachedAuthValidator::new(
            Arc::clone(&cache),
            Arc::new(authority),
            breaker,
            ValidatorSettings::from(&config.auth),
        ));
        Self {
            guard: Arc::new(AuthGuard::new(validator, &config.auth)),
            cache,
        }
    }
}

fn build_authority(
    config: &Config,
    targets: &BTreeMap<String, ConnectionTarget>,
    resolver: &Resolver,
) -> Result<HttpAuthority> {
    let name = &config.auth.authority;
    let target = targets
        .get(name)
        .ok_or_else(|| Error::Config(format!("auth.authority: no dependency named '{name}'")))?;
    HttpAuthority::new(
        name,
        target,
        &config.auth.validate_path,
        Some(resolver.clone()),
        config.auth.authority_timeout,
    )
}

type BuiltCache = (Arc<dyn AuthCache>, Option<Arc<MemoryAuthCache>>);

fn build_auth_cache(config: &Config, targets: &BTreeMap<String, ConnectionTarget>) -> Result<BuiltCache> {
    match config.auth.cache {
        AuthCacheKind::Memory => {
            let memory = Arc::new(MemoryAuthCache::new());
            Ok((Arc::clone(&memory) as Arc<dyn AuthCache>, Some(memory)))
        }
        #[cfg(feature = "redis-cache")]
        AuthCacheKind::Redis => {
            let name = &config.auth.cache_dependency;
            let target = targets
                .get(name)
                .ok_or_else(|| Error::Config(format!("auth.cache_dependency: no dependency named '{name}'")))?;
            let cache = crate::auth::RedisAuthCache::new(name, target)?;
            Ok((Arc::new(cache), None))
        }
        #[cfg(not(feature = "redis-cache"))]
        AuthCacheKind::Redis => {
            let _ = targets;
            Err(Error::Config(
                "auth.cache: redis requires the `redis-cache` feature".into(),
            ))
        }
    }
}

/// One probe per dependency, named after it: breaker state plus an optional
/// TCP reachability check. The auth cache gets its own probe.
fn build_probes(
    config: &Config,
    targets: &BTreeMap<String, ConnectionTarget>,
    breakers: &BreakerRegistry,
    resolver: &Resolver,
    auth_cache: Option<&Arc<dyn AuthCache>>,
) -> Vec<Arc<dyn Probe>> {
    let mut probes: Vec<Arc<dyn Probe>> = Vec::with_capacity(config.dependencies.len() + 1);

    for (name, dep) in &config.dependencies {
        let mut parts: Vec<Arc<dyn Probe>> = Vec::new();
        if let Some(breaker) = breakers.get(name) {
            parts.push(Arc::new(BreakerProbe::new(breaker, dep.critical)));
        }
        if let (true, Some(target)) = (dep.probe, targets.get(name)) {
            parts.push(Arc::new(TcpProbe::new(
                name,
                dep.critical,
                &target.host,
                target.port,
                resolver.clone(),
            )));
        }
        probes.push(Arc::new(CompositeProbe::new(name, dep.critical, parts)));
    }

    if let Some(cache) = auth_cache {
        probes.push(Arc::new(CacheProbe::new(Arc::clone(cache), false)));
    }

    probes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DependencyConfig, DependencyKind};
    use crate::health::HealthStatus;

    fn http_dep(host: &str, critical: bool) -> DependencyConfig {
        DependencyConfig {
            kind: DependencyKind::Http,
            host: Some(host.to_string()),
            port: Some(1),
            critical,
            probe: false,
            ..Default::default()
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config
            .dependencies
            .insert("tracking".into(), http_dep("127.0.0.1", false));
        config
            .dependencies
            .insert("authority".into(), http_dep("127.0.0.1", true));
        config
    }

    #[test]
    fn test_init_registers_everything() {
        let layer = ResilienceLayer::init(config()).unwrap();
        assert_eq!(layer.breakers().len(), 2);
        assert!(layer.auth().is_none());
        assert_eq!(layer.target("tracking").unwrap().authority(), "127.0.0.1:1");
        assert_eq!(layer.health().probe_names(), vec!["authority", "tracking"]);
    }

    #[test]
    fn test_init_with_memory_auth() {
        let mut config = config();
        config.auth.enabled = true;
        let layer = ResilienceLayer::init(config).unwrap();
        let guard = layer.auth().unwrap();
        assert_eq!(guard.validator().breaker().name(), "authority");
        assert!(layer.health().probe_names().contains(&"auth_cache".to_string()));
    }

    #[test]
    fn test_init_rejects_unaddressable_dependency() {
        let mut config = config();
        config.dependencies.insert(
            "broken".into(),
            DependencyConfig {
                kind: DependencyKind::Redis,
                host: None,
                ..Default::default()
            },
        );
        assert!(matches!(ResilienceLayer::init(config), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_open_non_critical_breaker_is_degraded() {
        let layer = ResilienceLayer::init(config()).unwrap();
        let breaker = layer.breakers().require("tracking").unwrap();
        for _ in 0..5 {
            let _: Result<()> = breaker
                .call(|| async { Err(Error::dependency("tracking", "down")) })
                .await;
        }

        let snapshot = layer.health().snapshot().await;
        assert_eq!(snapshot.overall, HealthStatus::Degraded);
        assert_eq!(snapshot.dependencies["tracking"].status, HealthStatus::Unhealthy);
        assert_eq!(snapshot.dependencies["authority"].status, HealthStatus::Healthy);
    }

    #[test]
    fn test_reload_applies_new_thresholds_and_targets() {
        let layer = ResilienceLayer::init(config()).unwrap();

        let mut new = config();
        new.dependencies.get_mut("tracking").unwrap().circuit_breaker.failure_threshold = 2;
        new.dependencies.get_mut("tracking").unwrap().port = Some(2);
        new.dependencies.remove("authority");
        layer.apply_reload(new).unwrap();

        assert_eq!(layer.target("tracking").unwrap().port, 2);
        assert!(layer.target("authority").is_none());
        assert!(layer.breakers().get("authority").is_none());
        assert_eq!(
            layer.config().dependencies["tracking"].circuit_breaker.failure_threshold,
            2
        );
        assert_eq!(layer.health().probe_names(), vec!["tracking"]);
    }

    #[test]
    fn test_reload_rebuilds_auth_only_when_authority_moves() {
        let mut config = config();
        config.auth.enabled = true;
        let layer = ResilienceLayer::init(config.clone()).unwrap();
        let before = layer.auth().unwrap();

        let mut unrelated = config.clone();
        unrelated.dependencies.get_mut("tracking").unwrap().port = Some(2);
        layer.apply_reload(unrelated.clone()).unwrap();
        assert!(Arc::ptr_eq(&before, &layer.auth().unwrap()));

        let mut moved = unrelated;
        moved.dependencies.get_mut("authority").unwrap().port = Some(3);
        layer.apply_reload(moved).unwrap();
        let after = layer.auth().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(Arc::ptr_eq(before.validator().breaker(), after.validator().breaker()));
    }

    #[test]
    fn test_invalid_reload_keeps_previous_config() {
        let layer = ResilienceLayer::init(config()).unwrap();

        let mut bad = config();
        bad.dependencies.get_mut("tracking").unwrap().port = Some(0);
        assert!(matches!(layer.apply_reload(bad), Err(Error::Config(_))));

        assert_eq!(layer.target("tracking").unwrap().port, 1);
        assert_eq!(layer.breakers().len(), 2);
    }
}
