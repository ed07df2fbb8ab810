//! Cached name resolution with stale and static fallback
//!
//! Live lookups go through a [`NameBackend`] under a deadline. Successful
//! results are cached for a fixed TTL. When a lookup fails the resolver
//! serves the last known addresses (`CachedStale`), then a configured
//! override (`StaticOverride`), and only then gives up.

use std::{
    collections::HashMap,
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ResolverConfig, humantime_serde};
use crate::singleflight::SingleFlight;
use crate::telemetry;
use crate::{Error, Result};

/// Where a resolved endpoint came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// Fresh result of a live lookup (or a literal address)
    Live,
    /// Previous live result served after a failed lookup
    CachedStale,
    /// Configured address served when no live result ever succeeded
    StaticOverride,
}

impl ResolutionSource {
    /// Label for logs and metrics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::CachedStale => "cached_stale",
            Self::StaticOverride => "static_override",
        }
    }

    /// Whether callers should treat the address with reduced confidence
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        !matches!(self, Self::Live)
    }
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A logical name mapped to addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedEndpoint {
    /// Name as requested (normalized)
    pub logical_name: String,
    /// Addresses, never empty; the first is the primary
    pub addresses: Vec<IpAddr>,
    /// Wall-clock time of the live lookup that produced the addresses
    pub resolved_at: DateTime<Utc>,
    /// Freshness window of the live lookup
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Provenance
    pub source: ResolutionSource,
    #[serde(skip)]
    fetched: Instant,
}

impl ResolvedEndpoint {
    fn new(logical_name: String, addresses: Vec<IpAddr>, ttl: Duration, source: ResolutionSource) -> Self {
        Self {
            logical_name,
            addresses,
            resolved_at: Utc::now(),
            ttl,
            source,
            fetched: Instant::now(),
        }
    }

    /// Primary address
    #[must_use]
    pub fn address(&self) -> IpAddr {
        // Constructors only ever receive non-empty lists
        self.addresses[0]
    }

    /// Socket addresses for `port`
    pub fn socket_addrs(&self, port: u16) -> impl Iterator<Item = SocketAddr> + '_ {
        self.addresses.iter().map(move |ip| SocketAddr::new(*ip, port))
    }

    /// Whether the entry is still within its TTL
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.fetched.elapsed() < self.ttl
    }
}

/// Network name-resolution backend
#[async_trait]
pub trait NameBackend: Send + Sync {
    /// Look up every address for `name`
    async fn lookup(&self, name: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// System resolver via `tokio::net::lookup_host`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBackend;

#[async_trait]
impl NameBackend for SystemBackend {
    async fn lookup(&self, name: &str) -> std::io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((name, 0)).await?;
        Ok(addrs.map(|sa| sa.ip()).collect())
    }
}

type LookupOutcome = std::result::Result<ResolvedEndpoint, String>;

/// Caching resolver; cheap to clone, clones share state
#[derive(Clone)]
pub struct Resolver {
    backend: Arc<dyn NameBackend>,
    cache: Arc<DashMap<String, ResolvedEndpoint>>,
    overrides: Arc<HashMap<String, IpAddr>>,
    ttl: Duration,
    lookup_timeout: Duration,
    flights: SingleFlight<String, LookupOutcome>,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("cached", &self.cache.len())
            .field("overrides", &self.overrides.len())
            .field("ttl", &self.ttl)
            .field("lookup_timeout", &self.lookup_timeout)
            .finish_non_exhaustive()
    }
}

impl Resolver {
    /// Create a resolver over the system backend
    pub fn from_config(config: &ResolverConfig) -> Result<Self> {
        Self::with_backend(config, Arc::new(SystemBackend))
    }

    /// Create a resolver over a specific backend
    pub fn with_backend(config: &ResolverConfig, backend: Arc<dyn NameBackend>) -> Result<Self> {
        Ok(Self {
            backend,
            cache: Arc::new(DashMap::new()),
            overrides: Arc::new(config.parsed_overrides()?),
            ttl: config.ttl,
            lookup_timeout: config.lookup_timeout,
            flights: SingleFlight::new(),
        })
    }

    /// Resolve a logical name
    ///
    /// A fresh cache entry is returned without touching the network.
    /// Concurrent lookups for one name share a single backend call.
    pub async fn resolve(&self, logical_name: &str) -> Result<ResolvedEndpoint> {
        let name = normalize(logical_name);
        if name.is_empty() {
            return Err(Error::Resolution {
                name: logical_name.to_string(),
                reason: "empty name".to_string(),
            });
        }

        if let Some(ip) = literal_ip(&name) {
            return Ok(ResolvedEndpoint::new(name, vec![ip], self.ttl, ResolutionSource::Live));
        }

        if let Some(entry) = self.cache.get(&name).filter(|e| e.is_fresh()) {
            debug!(name = %name, source = "live", "Resolved from cache");
            return Ok(entry.clone());
        }

        let outcome = self
            .flights
            .run(name.clone(), || self.live_lookup(name.clone()))
            .await
            .map_or_else(|e| Err(e.to_string()), |(outcome, _)| outcome);

        match outcome {
            Ok(endpoint) => {
                telemetry::record_resolution(ResolutionSource::Live.as_str());
                debug!(name = %name, source = "live", address = %endpoint.address(), "Resolved");
                Ok(endpoint)
            }
            Err(reason) => self.fallback(&name, reason),
        }
    }

    /// The flight body: lookup under deadline, then cache write
    fn live_lookup(&self, name: String) -> impl Future<Output = LookupOutcome> + Send + 'static {
        let backend = Arc::clone(&self.backend);
        let cache = Arc::clone(&self.cache);
        let ttl = self.ttl;
        let deadline = self.lookup_timeout;

        async move {
            let addresses = match tokio::time::timeout(deadline, backend.lookup(&name)).await {
                Ok(Ok(addrs)) => dedup(addrs),
                Ok(Err(e)) => return Err(e.to_string()),
                Err(_) => return Err(format!("lookup timed out after {}ms", deadline.as_millis())),
            };
            if addresses.is_empty() {
                return Err("no addresses returned".to_string());
            }
            let endpoint = ResolvedEndpoint::new(name.clone(), addresses, ttl, ResolutionSource::Live);
            cache.insert(name, endpoint.clone());
            Ok(endpoint)
        }
    }

    fn fallback(&self, name: &str, reason: String) -> Result<ResolvedEndpoint> {
        if let Some(stale) = self.cache.get(name) {
            let mut endpoint = stale.clone();
            endpoint.source = ResolutionSource::CachedStale;
            telemetry::record_resolution(endpoint.source.as_str());
            warn!(
                name = %name,
                source = "cached_stale",
                address = %endpoint.address(),
                error = %reason,
                "Live lookup failed, serving stale address"
            );
            return Ok(endpoint);
        }

        if let Some(ip) = self.overrides.get(name) {
            telemetry::record_resolution(ResolutionSource::StaticOverride.as_str());
            warn!(
                name = %name,
                source = "static_override",
                address = %ip,
                error = %reason,
                "Live lookup failed, serving static override"
            );
            return Ok(ResolvedEndpoint::new(
                name.to_string(),
                vec![*ip],
                self.ttl,
                ResolutionSource::StaticOverride,
            ));
        }

        warn!(name = %name, error = %reason, "Resolution failed with no fallback");
        Err(Error::Resolution {
            name: name.to_string(),
            reason,
        })
    }

    /// Drop the cached entry for `name`
    pub fn purge(&self, logical_name: &str) -> bool {
        let removed = self.cache.remove(&normalize(logical_name)).is_some();
        if removed {
            info!(name = %logical_name, "Purged resolver cache entry");
        }
        removed
    }

    /// All cached endpoints, sorted by name
    pub fn entries(&self) -> Vec<ResolvedEndpoint> {
        let mut entries: Vec<_> = self.cache.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.logical_name.cmp(&b.logical_name));
        entries
    }
}

impl reqwest::dns::Resolve for Resolver {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let resolver = self.clone();
        Box::pin(async move {
            let endpoint = Resolver::resolve(&resolver, name.as_str()).await?;
            let addrs: reqwest::dns::Addrs = Box::new(endpoint.socket_addrs(0).collect::<Vec<_>>().into_iter());
            Ok(addrs)
        })
    }
}

fn normalize(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn literal_ip(name: &str) -> Option<IpAddr> {
    name.trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .ok()
}

fn dedup(addrs: Vec<IpAddr>) -> Vec<IpAddr> {
    let mut unique = Vec::with_capacity(addrs.len());
    for addr in addrs {
        if !unique.contains(&addr) {
            unique.push(addr);
        }
    }
    unique
}
