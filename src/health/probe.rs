//! Dependency probes

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::HealthStatus;
use crate::auth::AuthCache;
use crate::failsafe::{CircuitBreaker, CircuitState};
use crate::resolver::Resolver;

/// Result of one probe run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    /// Status of the probed dependency
    pub status: HealthStatus,
    /// Human-readable detail
    pub detail: String,
}

impl ProbeReport {
    /// Healthy with detail
    pub fn healthy(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            detail: detail.into(),
        }
    }

    /// Degraded with detail
    pub fn degraded(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            detail: detail.into(),
        }
    }

    /// Failed with detail
    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            detail: detail.into(),
        }
    }
}

/// A health check for one dependency
#[async_trait]
pub trait Probe: Send + Sync {
    /// Dependency name reported in the snapshot
    fn name(&self) -> &str;

    /// Whether failure makes the whole service unhealthy
    fn critical(&self) -> bool;

    /// Run the check. The aggregator applies the deadline.
    async fn check(&self) -> ProbeReport;
}

/// Reads a breaker's phase; no I/O
pub struct BreakerProbe {
    breaker: Arc<CircuitBreaker>,
    critical: bool,
}

impl BreakerProbe {
    /// Probe for `breaker`
    #[must_use]
    pub fn new(breaker: Arc<CircuitBreaker>, critical: bool) -> Self {
        Self { breaker, critical }
    }
}

#[async_trait]
impl Probe for BreakerProbe {
    fn name(&self) -> &str {
        self.breaker.name()
    }

    fn critical(&self) -> bool {
        self.critical
    }

    async fn check(&self) -> ProbeReport {
        let message = format!("circuit {}", self.breaker.status_message());
        match self.breaker.state() {
            CircuitState::Closed => ProbeReport::healthy(message),
            CircuitState::HalfOpen => ProbeReport::degraded(message),
            CircuitState::Open => ProbeReport::unhealthy(message),
        }
    }
}

/// Resolves a host through the [`Resolver`] and opens a TCP connection
pub struct TcpProbe {
    name: String,
    critical: bool,
    host: String,
    port: u16,
    resolver: Resolver,
}

impl TcpProbe {
    /// Probe `host:port`
    #[must_use]
    pub fn new(name: &str, critical: bool, host: &str, port: u16, resolver: Resolver) -> Self {
        Self {
            name: name.to_string(),
            critical,
            host: host.to_string(),
            port,
            resolver,
        }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn critical(&self) -> bool {
        self.critical
    }

    async fn check(&self) -> ProbeReport {
        let endpoint = match self.resolver.resolve(&self.host).await {
            Ok(endpoint) => endpoint,
            Err(e) => return ProbeReport::unhealthy(e.to_string()),
        };

        let addrs: Vec<_> = endpoint.socket_addrs(self.port).collect();
        match TcpStream::connect(addrs.as_slice()).await {
            Ok(_) if endpoint.source.is_degraded() => ProbeReport::degraded(format!(
                "reachable at {} ({} address)",
                endpoint.address(),
                endpoint.source
            )),
            Ok(_) => ProbeReport::healthy(format!("reachable at {}:{}", endpoint.address(), self.port)),
            Err(e) => ProbeReport::unhealthy(format!(
                "connect to {}:{} failed: {e}",
                endpoint.address(),
                self.port
            )),
        }
    }
}

/// Round-trips the auth cache
pub struct CacheProbe {
    cache: Arc<dyn AuthCache>,
    critical: bool,
}

impl CacheProbe {
    /// Probe for `cache`
    #[must_use]
    pub fn new(cache: Arc<dyn AuthCache>, critical: bool) -> Self {
        Self { cache, critical }
    }
}

#[async_trait]
impl Probe for CacheProbe {
    fn name(&self) -> &str {
        "auth_cache"
    }

    fn critical(&self) -> bool {
        self.critical
    }

    async fn check(&self) -> ProbeReport {
        match self.cache.ping().await {
            Ok(()) => ProbeReport::healthy(format!("{} cache responding", self.cache.backend())),
            Err(e) => ProbeReport::unhealthy(format!("{} cache: {e}", self.cache.backend())),
        }
    }
}

/// Several probes reported under one name; the worst status wins
pub struct CompositeProbe {
    name: String,
    critical: bool,
    parts: Vec<Arc<dyn Probe>>,
}

impl CompositeProbe {
    /// Combine `parts` under `name`
    #[must_use]
    pub fn new(name: &str, critical: bool, parts: Vec<Arc<dyn Probe>>) -> Self {
        Self {
            name: name.to_string(),
            critical,
            parts,
        }
    }
}

#[async_trait]
impl Probe for CompositeProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn critical(&self) -> bool {
        self.critical
    }

    async fn check(&self) -> ProbeReport {
        let mut status = HealthStatus::Healthy;
        let mut details = Vec::with_capacity(self.parts.len());
        for part in &self.parts {
            let report = part.check().await;
            status = status.worst(report.status);
            details.push(report.detail);
        }
        ProbeReport {
            status,
            detail: details.join("; "),
        }
    }
}
